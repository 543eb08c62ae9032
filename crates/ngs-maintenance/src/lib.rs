//! Maintenance windows: detection from mail and calendar invites, scope
//! matching, and suppression of alerts that fall inside active windows.

pub mod detect;
pub mod engine;
pub mod ics;
pub mod scope;

pub use detect::{MaintenanceDetector, WindowDetection, DEFAULT_SUBJECT_PREFIXES};
pub use engine::{MaintenanceEngine, WindowMatch};
pub use scope::{parse_selector_list, Scope, ScopeSubject};
