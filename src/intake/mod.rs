//! Non-HTTP intake adapters.

mod redis;

pub use self::redis::{IntakeMessage, IntakeTarget, RedisIntake};
