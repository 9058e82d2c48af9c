//! Peripheral and clipboard bridge for a connected session.
//!
//! A [`ShareLink`] exists only while its session is `Connected`. It holds no
//! I/O of its own: the session feeds it local and remote events and sends
//! whatever payloads it returns. Injection into the OS goes through the
//! host-supplied [`Peripherals`] capability.

use std::sync::Arc;

use tracing::{debug, trace};

use cooplink_core::device::DeviceId;
use cooplink_core::protocol::{
    ClipboardUpdatePayload, InputEvent, InputEventPayload, KeyEvent, PointerEvent,
};
use cooplink_core::settings::{ScreenEdge, SharePolicy};

/// Platform input injection and clipboard access, implemented by the host.
pub trait Peripherals: Send + Sync + 'static {
    fn inject_key_event(&self, event: KeyEvent);
    fn inject_pointer_event(&self, event: PointerEvent);
    fn read_clipboard(&self) -> Option<String>;
    fn write_clipboard(&self, text: &str);
}

/// [`Peripherals`] for hosts without injection support: drops input and
/// has an empty clipboard.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPeripherals;

impl Peripherals for NullPeripherals {
    fn inject_key_event(&self, event: KeyEvent) {
        trace!(?event, "Dropping key event");
    }

    fn inject_pointer_event(&self, event: PointerEvent) {
        trace!(?event, "Dropping pointer event");
    }

    fn read_clipboard(&self) -> Option<String> {
        None
    }

    fn write_clipboard(&self, _text: &str) {}
}

pub(crate) struct ShareLink {
    local_id: DeviceId,
    peripherals: Arc<dyn Peripherals>,
    /// Local input currently goes to the peer.
    controlling: bool,
    next_out_seq: u64,
    last_in_seq: Option<u64>,
    /// Lamport clock for clipboard changes.
    clock: u64,
    /// Stamp and origin of the clipboard content currently in effect.
    current: Option<(u64, DeviceId)>,
    /// Text last written from the peer; not sent back when the local
    /// watcher reports it.
    echo_guard: Option<String>,
}

impl ShareLink {
    pub(crate) fn new(local_id: DeviceId, peripherals: Arc<dyn Peripherals>) -> Self {
        Self {
            local_id,
            peripherals,
            controlling: false,
            next_out_seq: 1,
            last_in_seq: None,
            clock: 0,
            current: None,
            echo_guard: None,
        }
    }

    /// The pointer reached `edge`. Hands input to the peer when it is the
    /// configured edge and input sharing is on. Returns the new state.
    pub(crate) fn edge_reached(&mut self, edge: ScreenEdge, policy: &SharePolicy) -> bool {
        if policy.input_sharing && edge == policy.screen_edge && !self.controlling {
            debug!(?edge, "Input handed to peer");
            self.controlling = true;
        }
        self.controlling
    }

    pub(crate) fn release(&mut self) {
        if self.controlling {
            debug!("Input returned to local device");
        }
        self.controlling = false;
    }

    /// Stamps a local input event for forwarding, or returns `None` when
    /// input is not currently handed to the peer.
    pub(crate) fn outgoing_input(
        &mut self,
        event: InputEvent,
        policy: &SharePolicy,
    ) -> Option<InputEventPayload> {
        if !policy.input_sharing {
            self.controlling = false;
            return None;
        }
        if !self.controlling {
            return None;
        }
        let seq = self.next_out_seq;
        self.next_out_seq += 1;
        Some(InputEventPayload { seq, event })
    }

    /// Injects a remote input event if it is newer than everything injected
    /// so far. Returns whether it was injected.
    pub(crate) fn incoming_input(&mut self, payload: InputEventPayload, policy: &SharePolicy) -> bool {
        if !policy.input_sharing {
            trace!(seq = payload.seq, "Input sharing disabled, dropping event");
            return false;
        }
        if self.last_in_seq.is_some_and(|last| payload.seq <= last) {
            debug!(seq = payload.seq, last = ?self.last_in_seq, "Dropping stale or duplicate input");
            return false;
        }
        self.last_in_seq = Some(payload.seq);
        match payload.event {
            InputEvent::Key(key) => self.peripherals.inject_key_event(key),
            InputEvent::Pointer(pointer) => self.peripherals.inject_pointer_event(pointer),
        }
        true
    }

    /// Reads the local clipboard after a change notification and returns
    /// the update to send, if any.
    pub(crate) fn local_clipboard_changed(&mut self, policy: &SharePolicy) -> Option<ClipboardUpdatePayload> {
        if !policy.clipboard_sharing {
            return None;
        }
        let text = self.peripherals.read_clipboard()?;
        if self.echo_guard.as_deref() == Some(text.as_str()) {
            trace!("Clipboard change came from peer, not echoing");
            return None;
        }
        self.echo_guard = None;

        self.clock += 1;
        self.current = Some((self.clock, self.local_id.clone()));
        Some(ClipboardUpdatePayload {
            stamp: self.clock,
            origin: self.local_id.clone(),
            text,
        })
    }

    /// Applies a remote clipboard update under last-write-wins. Returns
    /// whether the local clipboard was written.
    pub(crate) fn incoming_clipboard(&mut self, update: ClipboardUpdatePayload, policy: &SharePolicy) -> bool {
        self.clock = self.clock.max(update.stamp);
        if !policy.clipboard_sharing {
            return false;
        }

        let newer = match &self.current {
            None => true,
            Some((stamp, origin)) => (update.stamp, &update.origin) > (*stamp, origin),
        };
        if !newer {
            debug!(stamp = update.stamp, "Ignoring older clipboard update");
            return false;
        }

        self.peripherals.write_clipboard(&update.text);
        self.current = Some((update.stamp, update.origin));
        self.echo_guard = Some(update.text);
        true
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingPeripherals;
    use super::*;

    fn link(id: &str) -> (ShareLink, Arc<RecordingPeripherals>) {
        let p = Arc::new(RecordingPeripherals::default());
        (ShareLink::new(DeviceId::from(id), p.clone()), p)
    }

    fn key(code: u32) -> InputEvent {
        InputEvent::Key(KeyEvent {
            code,
            pressed: true,
            modifiers: 0,
        })
    }

    #[test]
    fn given_not_controlling_when_forwarding_then_nothing_sent() {
        let (mut share, _) = link("a");
        assert!(share.outgoing_input(key(1), &SharePolicy::default()).is_none());
    }

    #[test]
    fn given_wrong_edge_when_reached_then_not_controlling() {
        let (mut share, _) = link("a");
        let policy = SharePolicy {
            screen_edge: ScreenEdge::Left,
            ..SharePolicy::default()
        };
        assert!(!share.edge_reached(ScreenEdge::Right, &policy));
        assert!(share.edge_reached(ScreenEdge::Left, &policy));
    }

    #[test]
    fn given_controlling_when_forwarding_then_sequence_increases() {
        let (mut share, _) = link("a");
        let policy = SharePolicy::default();
        share.edge_reached(policy.screen_edge, &policy);
        let first = share.outgoing_input(key(1), &policy).unwrap();
        let second = share.outgoing_input(key(2), &policy).unwrap();
        assert_eq!((first.seq, second.seq), (1, 2));

        share.release();
        assert!(share.outgoing_input(key(3), &policy).is_none());
    }

    #[test]
    fn given_input_sharing_disabled_when_edge_reached_then_stays_local() {
        let (mut share, _) = link("a");
        let policy = SharePolicy {
            input_sharing: false,
            ..SharePolicy::default()
        };
        assert!(!share.edge_reached(policy.screen_edge, &policy));
    }

    #[test]
    fn given_duplicate_or_reordered_input_when_received_then_injected_at_most_once_in_order() {
        let (mut share, p) = link("b");
        let policy = SharePolicy::default();
        let ev = |seq, code| InputEventPayload {
            seq,
            event: key(code),
        };

        assert!(share.incoming_input(ev(1, 10), &policy));
        assert!(share.incoming_input(ev(3, 30), &policy));
        assert!(!share.incoming_input(ev(2, 20), &policy));
        assert!(!share.incoming_input(ev(3, 30), &policy));

        let codes: Vec<u32> = p.keys.lock().unwrap().iter().map(|k| k.code).collect();
        assert_eq!(codes, [10, 30]);
    }

    #[test]
    fn given_pointer_event_when_received_then_injected_as_pointer() {
        let (mut share, p) = link("b");
        let payload = InputEventPayload {
            seq: 1,
            event: InputEvent::Pointer(PointerEvent::Move { dx: 3, dy: -2 }),
        };
        assert!(share.incoming_input(payload, &SharePolicy::default()));
        assert_eq!(p.pointers.lock().unwrap().len(), 1);
        assert!(p.keys.lock().unwrap().is_empty());
    }

    #[test]
    fn given_remote_clipboard_when_applied_then_not_echoed_back() {
        let (mut share, p) = link("b");
        let policy = SharePolicy::default();
        let applied = share.incoming_clipboard(
            ClipboardUpdatePayload {
                stamp: 1,
                origin: DeviceId::from("a"),
                text: "hello".into(),
            },
            &policy,
        );
        assert!(applied);
        assert_eq!(p.read_clipboard().as_deref(), Some("hello"));

        // The host's watcher fires for the write we just made.
        assert!(share.local_clipboard_changed(&policy).is_none());

        p.set_clipboard("typed locally");
        let update = share.local_clipboard_changed(&policy).unwrap();
        assert_eq!(update.text, "typed locally");
        assert!(update.stamp > 1);
    }

    #[test]
    fn given_older_remote_clipboard_when_received_then_ignored() {
        let (mut share, p) = link("b");
        let policy = SharePolicy::default();
        p.set_clipboard("mine");
        let local = share.local_clipboard_changed(&policy).unwrap();

        let stale = ClipboardUpdatePayload {
            stamp: local.stamp - 1,
            origin: DeviceId::from("a"),
            text: "old".into(),
        };
        assert!(!share.incoming_clipboard(stale, &policy));
        assert_eq!(p.read_clipboard().as_deref(), Some("mine"));
    }

    #[test]
    fn given_concurrent_equal_stamps_when_resolved_then_higher_origin_wins_on_both_sides() {
        let policy = SharePolicy::default();
        let (mut a, pa) = link("a");
        let (mut b, pb) = link("b");
        pa.set_clipboard("from a");
        pb.set_clipboard("from b");
        let ua = a.local_clipboard_changed(&policy).unwrap();
        let ub = b.local_clipboard_changed(&policy).unwrap();
        assert_eq!(ua.stamp, ub.stamp);

        assert!(a.incoming_clipboard(ub, &policy));
        assert!(!b.incoming_clipboard(ua, &policy));
        assert_eq!(pa.read_clipboard(), pb.read_clipboard());
        assert_eq!(pa.read_clipboard().as_deref(), Some("from b"));
    }

    #[test]
    fn given_clipboard_sharing_disabled_when_changed_then_nothing_sent() {
        let (mut share, p) = link("a");
        p.set_clipboard("secret");
        let policy = SharePolicy {
            clipboard_sharing: false,
            ..SharePolicy::default()
        };
        assert!(share.local_clipboard_changed(&policy).is_none());
    }
}
