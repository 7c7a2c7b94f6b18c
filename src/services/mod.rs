//! Service clients layered over the dialed device streams

pub mod afc;
pub mod crash_reports;
pub mod diagnostics_relay;
pub mod image_mounter;
pub mod lockdown;
pub mod syslog_relay;
pub mod web_inspector;
