//! Bridge to the privileged helper

mod bridge;

pub use bridge::HelperBridge;
