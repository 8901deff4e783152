use rust_fsm::*;

#[derive(Debug)]
pub enum ConnEvent {
    /// Send side transmits (or retransmits) a handshake request.
    Connect,
    /// Receive side sees a `sequence == 0` request.
    HandshakeRequest,
    /// Send side sees the acknowledgement of its request.
    HandshakeAck,
    /// Send side's end-of-stream packet was acknowledged.
    EosAck,
}

#[derive(Debug, PartialEq)]
pub enum ConnAction {
    SendHandshake,
    AckHandshake,
    ReAckHandshake,
    Activate,
    Ignore,
    Retire,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Null,
    AwaitingHandshakeAck,
    Started,
    EosSent,
}

state_machine! {
    #[state_machine(input(crate::fsm::ConnEvent), state(crate::fsm::ConnState), output(crate::fsm::ConnAction))]
    pub connection(Null)

    Null => {
        Connect => AwaitingHandshakeAck[SendHandshake],
        HandshakeRequest => Started[AckHandshake],
    },
    AwaitingHandshakeAck => {
        Connect => AwaitingHandshakeAck[SendHandshake],
        HandshakeAck => Started[Activate],
    },
    Started => {
        HandshakeRequest => Started[ReAckHandshake],
        HandshakeAck => Started[Ignore],
        EosAck => EosSent[Retire],
    },
    EosSent => {
        HandshakeAck => EosSent[Ignore],
        EosAck => EosSent[Ignore],
    }
}
