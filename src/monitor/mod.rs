pub mod alert;
pub mod availability;

pub use alert::{AlertDiagnostics, Alarm, PageAudioAlarm};
pub use availability::{wait_for_alert_end, Assessment, AvailabilityMonitor};
