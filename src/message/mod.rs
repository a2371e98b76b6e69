pub mod blob;
pub mod flags;
pub mod metadata;
pub mod msg;

pub use blob::Blob;
pub use flags::MsgFlags;
pub use metadata::Metadata;
pub use msg::Msg;
