use crate::protocol::message_type::MessageType;

/// A connection's acknowledgement mode. Both sides track it per peer, and both derive it from
///  the messages they see, so they agree without an explicit handshake.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum AckMode {
    /// only REGISTER style messages are acknowledged
    #[default]
    Auto,
    /// every message except ACKs and heartbeats is acknowledged
    Explicit,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ModeChange {
    None,
    EnableExplicit,
    Reset,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AckDecision {
    pub requires_ack: bool,
    pub mode_change: ModeChange,
}

impl AckDecision {
    /// the connection's mode after the message was processed
    pub fn next_mode(&self, current: AckMode) -> AckMode {
        match self.mode_change {
            ModeChange::None => current,
            ModeChange::EnableExplicit => AckMode::Explicit,
            ModeChange::Reset => AckMode::Auto,
        }
    }
}

/// The message type policy: whether a message of a given type requires acknowledgement when
///  the connection is in a given mode, and how the message affects the mode.
///
/// NB: The acknowledgement requirement is evaluated against the mode *before* the message is
///      applied, so an UNREGISTER in explicit mode is still acknowledged
pub fn ack_decision(message_type: MessageType, mode: AckMode) -> AckDecision {
    use MessageType::*;

    let explicit = mode == AckMode::Explicit;

    let (requires_ack, mode_change) = match message_type {
        Register => (true, ModeChange::None),
        RegisterWithAcknowledges => (true, ModeChange::EnableExplicit),
        StateId | Command => (explicit, ModeChange::None),
        Unregister => (explicit, ModeChange::Reset),
        Ack | Heartbeat => (false, ModeChange::None),
    };

    AckDecision { requires_ack, mode_change }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;
    use MessageType::*;

    #[rstest]
    #[case::register_auto(Register, AckMode::Auto, true, AckMode::Auto)]
    #[case::register_explicit(Register, AckMode::Explicit, true, AckMode::Explicit)]
    #[case::register_with_acks_auto(RegisterWithAcknowledges, AckMode::Auto, true, AckMode::Explicit)]
    #[case::register_with_acks_explicit(RegisterWithAcknowledges, AckMode::Explicit, true, AckMode::Explicit)]
    #[case::state_id_auto(StateId, AckMode::Auto, false, AckMode::Auto)]
    #[case::state_id_explicit(StateId, AckMode::Explicit, true, AckMode::Explicit)]
    #[case::command_auto(Command, AckMode::Auto, false, AckMode::Auto)]
    #[case::command_explicit(Command, AckMode::Explicit, true, AckMode::Explicit)]
    #[case::unregister_auto(Unregister, AckMode::Auto, false, AckMode::Auto)]
    #[case::unregister_explicit(Unregister, AckMode::Explicit, true, AckMode::Auto)]
    #[case::ack_auto(Ack, AckMode::Auto, false, AckMode::Auto)]
    #[case::ack_explicit(Ack, AckMode::Explicit, false, AckMode::Explicit)]
    #[case::heartbeat_auto(Heartbeat, AckMode::Auto, false, AckMode::Auto)]
    #[case::heartbeat_explicit(Heartbeat, AckMode::Explicit, false, AckMode::Explicit)]
    fn test_ack_decision(#[case] message_type: MessageType, #[case] mode: AckMode, #[case] expected_requires_ack: bool, #[case] expected_mode: AckMode) {
        let decision = ack_decision(message_type, mode);
        assert_eq!(decision.requires_ack, expected_requires_ack);
        assert_eq!(decision.next_mode(mode), expected_mode);
    }

    #[test]
    fn test_mode_toggled_once() {
        let mut mode = AckMode::default();
        let mut acked = Vec::new();
        for message_type in [Register, RegisterWithAcknowledges, StateId, Command] {
            let decision = ack_decision(message_type, mode);
            acked.push(decision.requires_ack);
            mode = decision.next_mode(mode);
        }
        assert_eq!(acked, vec![true, true, true, true]);
        assert_eq!(mode, AckMode::Explicit);
    }
}
