//! Upper layer protocol state machine
//!
//! This module implements the finite state machine of PS3.8 §9.2:
//! thirteen states ([`State`]), the events that drive transitions
//! ([`Event`], one per local service primitive, transport indication,
//! received PDU kind and timer expiry),
//! and the named actions an implementation must carry out on each
//! transition ([`Action`]).
//!
//! The machine itself is free of I/O.
//! [`transition`] is the full transition table,
//! and [`StateMachine`] tracks the current state of one association,
//! leaving the interpretation of actions
//! (socket writes, timer management, indications to the service user)
//! to the association runtime that owns it.

use snafu::Snafu;

/// The thirteen states of an upper layer association (PS3.8 Table 9-10).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum State {
    /// Sta1 - idle, no association and no transport connection
    Sta1,
    /// Sta2 - transport connection open,
    /// awaiting A-ASSOCIATE-RQ PDU
    Sta2,
    /// Sta3 - awaiting local A-ASSOCIATE response primitive
    Sta3,
    /// Sta4 - awaiting transport connection opening to complete
    Sta4,
    /// Sta5 - awaiting A-ASSOCIATE-AC or A-ASSOCIATE-RJ PDU
    Sta5,
    /// Sta6 - association established and ready for data transfer
    Sta6,
    /// Sta7 - awaiting A-RELEASE-RP PDU
    Sta7,
    /// Sta8 - awaiting local A-RELEASE response primitive
    Sta8,
    /// Sta9 - release collision requestor side,
    /// awaiting local A-RELEASE response primitive
    Sta9,
    /// Sta10 - release collision acceptor side,
    /// awaiting A-RELEASE-RP PDU
    Sta10,
    /// Sta11 - release collision requestor side,
    /// awaiting A-RELEASE-RP PDU
    Sta11,
    /// Sta12 - release collision acceptor side,
    /// awaiting local A-RELEASE response primitive
    Sta12,
    /// Sta13 - awaiting transport connection close
    Sta13,
}

/// Which end of the association this node is,
/// as established at association time.
///
/// The distinction only affects the release collision transition,
/// where the association requestor proceeds through Sta9/Sta11
/// and the acceptor through Sta10/Sta12.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Role {
    /// this node requested the association
    Requestor,
    /// this node accepted the association
    Acceptor,
}

/// An input to the state machine (PS3.8 Table 9-9).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Event {
    /// Evt1 - A-ASSOCIATE request primitive from the local user
    AAssociateRq,
    /// Evt2 - transport connection confirmed (connect completed)
    TransportConnConfirm,
    /// Evt3 - A-ASSOCIATE-AC PDU received
    AAssociateAcPdu,
    /// Evt4 - A-ASSOCIATE-RJ PDU received
    AAssociateRjPdu,
    /// Evt5 - transport connection indication (inbound connect)
    TransportConnIndication,
    /// Evt6 - A-ASSOCIATE-RQ PDU received
    AAssociateRqPdu,
    /// Evt7 - A-ASSOCIATE response primitive (accept) from the local user
    AAssociateResponseAccept,
    /// Evt8 - A-ASSOCIATE response primitive (reject) from the local user
    AAssociateResponseReject,
    /// Evt9 - P-DATA request primitive from the local user
    PDataRq,
    /// Evt10 - P-DATA-TF PDU received
    PDataTfPdu,
    /// Evt11 - A-RELEASE request primitive from the local user
    AReleaseRq,
    /// Evt12 - A-RELEASE-RQ PDU received
    AReleaseRqPdu,
    /// Evt13 - A-RELEASE-RP PDU received
    AReleaseRpPdu,
    /// Evt14 - A-RELEASE response primitive from the local user
    AReleaseRsp,
    /// Evt15 - A-ABORT request primitive from the local user
    AAbortRq,
    /// Evt16 - A-ABORT PDU received
    AAbortPdu,
    /// Evt17 - transport connection closed indication
    TransportClosed,
    /// Evt18 - ARTIM timer expired
    ArtimExpired,
    /// Evt19 - unrecognized or invalid PDU received
    InvalidPdu,
}

/// A named action of the state machine (PS3.8 §9.2.3).
///
/// The owner of the machine performs the side effects;
/// the action value only names what must be done.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Action {
    /// AE-1 - issue transport connect request
    Ae1,
    /// AE-2 - send A-ASSOCIATE-RQ PDU
    Ae2,
    /// AE-3 - issue A-ASSOCIATE confirmation (accept) primitive
    Ae3,
    /// AE-4 - issue A-ASSOCIATE confirmation (reject) primitive
    /// and close the transport connection
    Ae4,
    /// AE-5 - issue transport connection response and start ARTIM
    Ae5,
    /// AE-6 - stop ARTIM and issue the A-ASSOCIATE indication primitive
    Ae6,
    /// AE-7 - send A-ASSOCIATE-AC PDU
    Ae7,
    /// AE-8 - send A-ASSOCIATE-RJ PDU and start ARTIM
    Ae8,
    /// DT-1 - send P-DATA-TF PDU
    Dt1,
    /// DT-2 - issue P-DATA indication primitive
    Dt2,
    /// AR-1 - send A-RELEASE-RQ PDU
    Ar1,
    /// AR-2 - issue A-RELEASE indication primitive
    Ar2,
    /// AR-3 - issue A-RELEASE confirmation primitive
    /// and close the transport connection
    Ar3,
    /// AR-4 - send A-RELEASE-RP PDU and start ARTIM
    Ar4,
    /// AR-5 - stop ARTIM
    Ar5,
    /// AR-6 - issue P-DATA indication primitive (release pending)
    Ar6,
    /// AR-7 - send P-DATA-TF PDU (release collision)
    Ar7,
    /// AR-8 - issue A-RELEASE indication (release collision)
    Ar8,
    /// AR-9 - send A-RELEASE-RP PDU (release collision)
    Ar9,
    /// AR-10 - issue A-RELEASE confirmation (release collision)
    Ar10,
    /// AA-1 - send A-ABORT PDU (service-user source) and start ARTIM
    Aa1,
    /// AA-2 - stop ARTIM and close the transport connection
    Aa2,
    /// AA-3 - issue A-ABORT / A-P-ABORT indication
    /// and close the transport connection
    Aa3,
    /// AA-4 - issue A-P-ABORT indication
    Aa4,
    /// AA-5 - stop ARTIM
    Aa5,
    /// AA-6 - ignore the PDU
    Aa6,
    /// AA-7 - send A-ABORT PDU (service-provider source)
    Aa7,
    /// AA-8 - send A-ABORT PDU (service-provider source),
    /// issue an A-P-ABORT indication and start ARTIM
    Aa8,
}

/// The output of a transition: the action to carry out
/// and the state the machine moves to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Transition {
    pub action: Action,
    pub next: State,
}

const fn t(action: Action, next: State) -> Transition {
    Transition { action, next }
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// a local primitive was issued in a state where it is not allowed
    #[snafu(display("primitive {:?} not allowed in state {:?}", event, state))]
    IllegalPrimitive { event: Event, state: State },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Look up the transition for the given state and event.
///
/// Received PDUs that are not allowed in the current state
/// uniformly resolve to AA-8
/// (send A-ABORT, indicate A-P-ABORT, start ARTIM, go to Sta13).
/// Local primitives issued in the wrong state are local programming
/// errors and yield [`Error::IllegalPrimitive`] without a transition.
pub fn transition(state: State, event: Event, role: Role) -> Result<Transition> {
    use Action::*;
    use Event::*;
    use State::*;

    let transition = match (event, state) {
        // association establishment, requestor side
        (AAssociateRq, Sta1) => t(Ae1, Sta4),
        (TransportConnConfirm, Sta4) => t(Ae2, Sta5),
        (AAssociateAcPdu, Sta2) => t(Aa1, Sta13),
        (AAssociateAcPdu, Sta3) => t(Aa8, Sta13),
        (AAssociateAcPdu, Sta5) => t(Ae3, Sta6),
        (AAssociateAcPdu, Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => t(Aa8, Sta13),
        (AAssociateAcPdu, Sta13) => t(Aa6, Sta13),
        (AAssociateRjPdu, Sta2) => t(Aa1, Sta13),
        (AAssociateRjPdu, Sta3) => t(Aa8, Sta13),
        (AAssociateRjPdu, Sta5) => t(Ae4, Sta1),
        (AAssociateRjPdu, Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => t(Aa8, Sta13),
        (AAssociateRjPdu, Sta13) => t(Aa6, Sta13),

        // association establishment, acceptor side
        (TransportConnIndication, Sta1) => t(Ae5, Sta2),
        (AAssociateRqPdu, Sta2) => t(Ae6, Sta3),
        (AAssociateRqPdu, Sta3 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => {
            t(Aa8, Sta13)
        }
        (AAssociateRqPdu, Sta13) => t(Aa7, Sta13),
        (AAssociateResponseAccept, Sta3) => t(Ae7, Sta6),
        (AAssociateResponseReject, Sta3) => t(Ae8, Sta13),

        // data transfer
        (PDataRq, Sta6) => t(Dt1, Sta6),
        (PDataRq, Sta8) => t(Ar7, Sta8),
        (PDataTfPdu, Sta2) => t(Aa1, Sta13),
        (PDataTfPdu, Sta3 | Sta5) => t(Aa8, Sta13),
        (PDataTfPdu, Sta6) => t(Dt2, Sta6),
        (PDataTfPdu, Sta7) => t(Ar6, Sta7),
        (PDataTfPdu, Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => t(Aa8, Sta13),
        (PDataTfPdu, Sta13) => t(Aa6, Sta13),

        // association release
        (AReleaseRq, Sta6) => t(Ar1, Sta7),
        (AReleaseRqPdu, Sta2) => t(Aa1, Sta13),
        (AReleaseRqPdu, Sta3 | Sta5) => t(Aa8, Sta13),
        (AReleaseRqPdu, Sta6) => t(Ar2, Sta8),
        (AReleaseRqPdu, Sta7) => match role {
            // release collision (PS3.8 §9.2.2.4)
            Role::Requestor => t(Ar8, Sta9),
            Role::Acceptor => t(Ar8, Sta10),
        },
        (AReleaseRqPdu, Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => t(Aa8, Sta13),
        (AReleaseRqPdu, Sta13) => t(Aa6, Sta13),
        (AReleaseRpPdu, Sta2) => t(Aa1, Sta13),
        (AReleaseRpPdu, Sta3 | Sta5 | Sta6) => t(Aa8, Sta13),
        (AReleaseRpPdu, Sta7) => t(Ar3, Sta1),
        (AReleaseRpPdu, Sta8 | Sta9) => t(Aa8, Sta13),
        (AReleaseRpPdu, Sta10) => t(Ar10, Sta12),
        (AReleaseRpPdu, Sta11) => t(Ar3, Sta1),
        (AReleaseRpPdu, Sta12) => t(Aa8, Sta13),
        (AReleaseRpPdu, Sta13) => t(Aa6, Sta13),
        (AReleaseRsp, Sta8) => t(Ar4, Sta13),
        (AReleaseRsp, Sta9) => t(Ar9, Sta11),
        (AReleaseRsp, Sta12) => t(Ar4, Sta13),

        // abort
        (AAbortRq, Sta3) => t(Aa1, Sta13),
        (AAbortRq, Sta4) => t(Aa2, Sta1),
        (AAbortRq, Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => t(Aa1, Sta13),
        (AAbortPdu, Sta2) => t(Aa2, Sta1),
        (AAbortPdu, Sta3 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => {
            t(Aa3, Sta1)
        }
        (AAbortPdu, Sta13) => t(Aa2, Sta1),

        // transport closure and timers
        (TransportClosed, Sta2) => t(Aa5, Sta1),
        (TransportClosed, Sta3 | Sta4 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => {
            t(Aa4, Sta1)
        }
        (TransportClosed, Sta13) => t(Ar5, Sta1),
        (ArtimExpired, Sta2) => t(Aa2, Sta1),
        (ArtimExpired, Sta13) => t(Aa2, Sta1),

        // invalid PDUs
        (InvalidPdu, Sta2) => t(Aa1, Sta13),
        (InvalidPdu, Sta3 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12) => {
            t(Aa8, Sta13)
        }
        (InvalidPdu, Sta13) => t(Aa7, Sta13),

        // everything else is a misuse of the local API
        (event, state) => return IllegalPrimitiveSnafu { event, state }.fail(),
    };

    Ok(transition)
}

/// The state machine of a single association.
#[derive(Debug)]
pub struct StateMachine {
    state: State,
    role: Role,
}

impl StateMachine {
    /// Create a state machine in the idle state.
    pub fn new(role: Role) -> Self {
        StateMachine { state: State::Sta1, role }
    }

    /// The current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// The role this node plays on the association.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the association is in the data transfer state.
    pub fn is_established(&self) -> bool {
        self.state == State::Sta6
    }

    /// Apply an event, moving to the next state
    /// and returning the action to carry out.
    pub fn apply(&mut self, event: Event) -> Result<Action> {
        let Transition { action, next } = transition(self.state, event, self.role)?;
        tracing::trace!(
            "{:?} + {:?} -> {:?} ({:?})",
            self.state,
            event,
            next,
            action
        );
        self.state = next;
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::Action::*;
    use super::Event::*;
    use super::State::*;
    use super::*;

    fn assert_transition(state: State, event: Event, action: Action, next: State) {
        let tr = transition(state, event, Role::Requestor).expect("transition must exist");
        assert_eq!(tr.action, action, "action for {:?} + {:?}", state, event);
        assert_eq!(tr.next, next, "next state for {:?} + {:?}", state, event);
    }

    #[test]
    fn requestor_establishment_path() {
        let mut machine = StateMachine::new(Role::Requestor);
        assert_eq!(machine.state(), Sta1);
        assert_eq!(machine.apply(AAssociateRq).unwrap(), Ae1);
        assert_eq!(machine.state(), Sta4);
        assert_eq!(machine.apply(TransportConnConfirm).unwrap(), Ae2);
        assert_eq!(machine.state(), Sta5);
        assert_eq!(machine.apply(AAssociateAcPdu).unwrap(), Ae3);
        assert_eq!(machine.state(), Sta6);
        assert!(machine.is_established());
    }

    #[test]
    fn requestor_rejection_path() {
        let mut machine = StateMachine::new(Role::Requestor);
        machine.apply(AAssociateRq).unwrap();
        machine.apply(TransportConnConfirm).unwrap();
        assert_eq!(machine.apply(AAssociateRjPdu).unwrap(), Ae4);
        assert_eq!(machine.state(), Sta1);
    }

    #[test]
    fn acceptor_establishment_path() {
        let mut machine = StateMachine::new(Role::Acceptor);
        assert_eq!(machine.apply(TransportConnIndication).unwrap(), Ae5);
        assert_eq!(machine.state(), Sta2);
        assert_eq!(machine.apply(AAssociateRqPdu).unwrap(), Ae6);
        assert_eq!(machine.state(), Sta3);
        assert_eq!(machine.apply(AAssociateResponseAccept).unwrap(), Ae7);
        assert!(machine.is_established());
    }

    #[test]
    fn acceptor_rejection_path() {
        let mut machine = StateMachine::new(Role::Acceptor);
        machine.apply(TransportConnIndication).unwrap();
        machine.apply(AAssociateRqPdu).unwrap();
        assert_eq!(machine.apply(AAssociateResponseReject).unwrap(), Ae8);
        assert_eq!(machine.state(), Sta13);
        assert_eq!(machine.apply(TransportClosed).unwrap(), Ar5);
        assert_eq!(machine.state(), Sta1);
    }

    #[test]
    fn data_transfer_stays_established() {
        assert_transition(Sta6, PDataRq, Dt1, Sta6);
        assert_transition(Sta6, PDataTfPdu, Dt2, Sta6);
    }

    #[test]
    fn orderly_release_requestor() {
        assert_transition(Sta6, AReleaseRq, Ar1, Sta7);
        assert_transition(Sta7, AReleaseRpPdu, Ar3, Sta1);
    }

    #[test]
    fn orderly_release_acceptor() {
        assert_transition(Sta6, AReleaseRqPdu, Ar2, Sta8);
        assert_transition(Sta8, AReleaseRsp, Ar4, Sta13);
        assert_transition(Sta13, TransportClosed, Ar5, Sta1);
    }

    #[test]
    fn release_collision_depends_on_role() {
        let tr = transition(Sta7, AReleaseRqPdu, Role::Requestor).unwrap();
        assert_eq!(tr, Transition { action: Ar8, next: Sta9 });
        let tr = transition(Sta7, AReleaseRqPdu, Role::Acceptor).unwrap();
        assert_eq!(tr, Transition { action: Ar8, next: Sta10 });
    }

    #[test]
    fn release_collision_requestor_path() {
        let mut machine = StateMachine::new(Role::Requestor);
        machine.apply(AAssociateRq).unwrap();
        machine.apply(TransportConnConfirm).unwrap();
        machine.apply(AAssociateAcPdu).unwrap();
        machine.apply(AReleaseRq).unwrap();
        assert_eq!(machine.apply(AReleaseRqPdu).unwrap(), Ar8);
        assert_eq!(machine.state(), Sta9);
        assert_eq!(machine.apply(AReleaseRsp).unwrap(), Ar9);
        assert_eq!(machine.state(), Sta11);
        assert_eq!(machine.apply(AReleaseRpPdu).unwrap(), Ar3);
        assert_eq!(machine.state(), Sta1);
    }

    #[test]
    fn release_collision_acceptor_path() {
        let mut machine = StateMachine::new(Role::Acceptor);
        machine.apply(TransportConnIndication).unwrap();
        machine.apply(AAssociateRqPdu).unwrap();
        machine.apply(AAssociateResponseAccept).unwrap();
        machine.apply(AReleaseRq).unwrap();
        assert_eq!(machine.apply(AReleaseRqPdu).unwrap(), Ar8);
        assert_eq!(machine.state(), Sta10);
        assert_eq!(machine.apply(AReleaseRpPdu).unwrap(), Ar10);
        assert_eq!(machine.state(), Sta12);
        assert_eq!(machine.apply(AReleaseRsp).unwrap(), Ar4);
        assert_eq!(machine.state(), Sta13);
    }

    #[rstest::rstest]
    // a PDU in the wrong state sends an abort and awaits closure
    #[case(Sta3, AAssociateRqPdu)]
    #[case(Sta5, AAssociateRqPdu)]
    #[case(Sta7, AAssociateRqPdu)]
    #[case(Sta8, AAssociateRqPdu)]
    #[case(Sta9, AAssociateRqPdu)]
    #[case(Sta10, AAssociateRqPdu)]
    #[case(Sta11, AAssociateRqPdu)]
    #[case(Sta12, AAssociateRqPdu)]
    #[case(Sta8, PDataTfPdu)]
    #[case(Sta9, PDataTfPdu)]
    #[case(Sta10, PDataTfPdu)]
    #[case(Sta11, PDataTfPdu)]
    #[case(Sta12, PDataTfPdu)]
    #[case(Sta6, AAssociateAcPdu)]
    #[case(Sta6, AReleaseRpPdu)]
    #[case(Sta5, PDataTfPdu)]
    fn unexpected_pdus_abort_with_aa8(#[case] state: State, #[case] event: Event) {
        let tr = transition(state, event, Role::Requestor).unwrap();
        assert_eq!(tr, Transition { action: Aa8, next: Sta13 });
    }

    #[test]
    fn invalid_pdus_abort_then_reach_idle() {
        let mut machine = StateMachine::new(Role::Requestor);
        machine.apply(AAssociateRq).unwrap();
        machine.apply(TransportConnConfirm).unwrap();
        machine.apply(AAssociateAcPdu).unwrap();
        // a malformed PDU in Sta6 triggers AA-8 through Sta13,
        // and the transport closure brings the machine back to idle
        assert_eq!(machine.apply(InvalidPdu).unwrap(), Aa8);
        assert_eq!(machine.state(), Sta13);
        assert_eq!(machine.apply(TransportClosed).unwrap(), Ar5);
        assert_eq!(machine.state(), Sta1);
    }

    #[test]
    fn peer_abort_indication() {
        assert_transition(Sta6, AAbortPdu, Aa3, Sta1);
        assert_transition(Sta7, AAbortPdu, Aa3, Sta1);
    }

    #[test]
    fn transport_loss_is_a_provider_abort() {
        for state in [Sta3, Sta4, Sta5, Sta6, Sta7, Sta8, Sta9, Sta10, Sta11, Sta12] {
            let tr = transition(state, TransportClosed, Role::Requestor).unwrap();
            assert_eq!(tr, Transition { action: Aa4, next: Sta1 });
        }
    }

    #[test]
    fn artim_expiry_closes_half_open_states() {
        assert_transition(Sta2, ArtimExpired, Aa2, Sta1);
        assert_transition(Sta13, ArtimExpired, Aa2, Sta1);
    }

    #[test]
    fn local_primitives_in_wrong_state_are_rejected() {
        assert!(matches!(
            transition(Sta1, PDataRq, Role::Requestor),
            Err(Error::IllegalPrimitive { .. })
        ));
        assert!(matches!(
            transition(Sta5, AReleaseRq, Role::Requestor),
            Err(Error::IllegalPrimitive { .. })
        ));
        assert!(matches!(
            transition(Sta6, AAssociateRq, Role::Requestor),
            Err(Error::IllegalPrimitive { .. })
        ));
    }

    #[test]
    fn local_abort_sends_and_awaits_closure() {
        assert_transition(Sta6, AAbortRq, Aa1, Sta13);
        assert_transition(Sta4, AAbortRq, Aa2, Sta1);
    }
}
