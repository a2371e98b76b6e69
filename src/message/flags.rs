use bitflags::bitflags;

bitflags! {
    /// Flags associated with a `Msg` indicating its role or attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MsgFlags: u8 {
        /// More message parts follow this one.
        const MORE = 0b0001;
        /// Indicates a ZMTP command frame.
        const COMMAND = 0b0010;
        /// Frame carries a peer identity (routing id).
        const IDENTITY = 0b0100;
        /// Frame carries the authenticated credential (ZAP user id).
        const CREDENTIAL = 0b1000;
    }
}
