//! Background services.

pub mod heartbeat;

pub use heartbeat::{
    effective_interval, push_heartbeat, HeartbeatHandle, HeartbeatIdentity, HeartbeatPayload,
    ProgressHeartbeat, DEFAULT_HEARTBEAT_INTERVAL, MIN_HEARTBEAT_INTERVAL,
};
