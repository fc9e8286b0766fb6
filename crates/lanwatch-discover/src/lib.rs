//! lanwatch-discover: Network presence monitor.
//!
//! Wraps nmap to sweep and port-scan networks on a schedule, feeds the
//! results to the presence state machine, and delivers the resulting event
//! log to a JSON-lines file and the operator log.

pub mod config;
pub mod error;
pub mod nmap_xml;
pub mod notify;
pub mod persist;
pub mod scanner;
pub mod scheduler;
