pub mod curve;
pub mod mechanism;
pub mod null;
pub mod plain;

pub use curve::{CurveClientMechanism, CurveServerMechanism};
pub use mechanism::{MechanismStatus, SecurityMechanism};
pub use null::NullMechanism;
pub use plain::PlainMechanism;
