pub mod clock;
pub mod color;
pub mod config;
pub mod console;
pub mod credential;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod recovery;
pub mod schedule;
pub mod telemetry;
pub mod topics;
pub mod types;

pub use clock::{ClockMonitor, ContinuityEvent};
pub use color::{kelvin_to_rgb, Rgb};
pub use config::{ApiConfig, HardwareConfig, LightingConfig, NetworkConfig, RuntimeConfig};
pub use console::{ConsoleCommand, ConsoleError};
pub use credential::{load_credential, ApiKey, CredentialStore, API_KEY_LENGTH};
pub use debounce::{RawInputs, SensorDebouncers, SensorFrame};
pub use engine::{
    CycleInput, DeviceState, EngineAction, LightOutput, LightingEngine, RefreshOutcome,
    RefreshReason,
};
pub use error::{CredentialError, RecoveryError, RemoteError, ScheduleError};
pub use recovery::PortalReply;
pub use schedule::{Schedule, SchedulePoint, ScheduleStore, MAX_SCHEDULE_POINTS};
pub use telemetry::{TelemetryEventKind, TelemetryPayload};
pub use topics::*;
pub use types::{DeviceStatePayload, DeviceStatus, OperatingMode};
