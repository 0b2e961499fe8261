//! Field devices built on the Modbus session

pub mod breaker;
pub mod collector;
pub mod sensor;

pub use breaker::{
    ActionOutcome, BreakerModel, BreakerService, BreakerState, BreakerStatus, BreakerTiming,
    ControlWord, LockControlBreaker, SwitchControlBreaker,
};
pub use collector::{CollectionSummary, TemperatureCollector};
pub use sensor::{DetectionResult, ReadingStatus, SensorProtocol, TemperatureReading};
