pub mod config;
pub mod notifier;

pub use config::{AlarmConfig, AlarmConfigError, AlarmFilter, load_alarm_config};
pub use notifier::{AlarmKey, AlarmNotifier, NotifyError, parse_fault_code};
