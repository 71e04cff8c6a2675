// Alerting for danger-zone entries.
//
// Architecture:
// - model.rs: Alert payloads handed to the notification and audit sinks
// - debouncer.rs: Per-zone cooldown gate

pub mod debouncer;
pub mod model;
