pub mod compensation;
pub mod config;
pub mod learning;
pub mod preheat;
pub mod snapshot;
pub mod topics;
pub mod types;
pub mod window;

pub use compensation::{
    CompensationEngine, ControllerState, EngineAction, EngineEvent, EngineOutput, SkipReason,
};
pub use config::{
    CompensationConfig, NetworkConfig, RoomConfig, RoomEntry, RoomOptions, RoomSettings,
    RuntimeConfig,
};
pub use learning::{HeatingRateLearner, LearningEvent};
pub use preheat::{PreheatMarker, PreheatPlan};
pub use snapshot::{read_snapshot, SensorSnapshot, SnapshotError, WindowSensorState};
pub use topics::*;
pub use types::{
    EntityState, EntityStatus, HvacAction, HvacMode, RoomStatePayload, RoomStatus, StateSource,
};
pub use window::WindowGuard;
