//! Custom Resource Definitions for the service mirror
//!
//! The only resource this controller consumes is the [`Link`], which names
//! a remote cluster and the secret holding credentials to reach it.

mod link;

pub use link::{is_dns_label, Link, LinkSpec};
