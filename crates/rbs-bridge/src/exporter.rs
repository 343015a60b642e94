use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rbs_protocol::{Call, Fault, FaultKind, Reply};
use rbs_types::{ExporterConfig, ExporterId, ObjectNum, RemoteRef};
use tracing::debug;

use crate::error::{ExportError, ExportResult};

/// An object that can be invoked through a [`RemoteRef`].
///
/// Skeletons answer calls they do not understand with
/// [`Fault::unsupported_call`].
pub trait Skeleton: Send + Sync {
    fn dispatch(&self, call: Call) -> Reply;

    /// Short description for logs.
    fn kind(&self) -> &'static str;

    /// The session holding this object ended without releasing it.
    fn release(&self) {}
}

struct Entry {
    skeleton: Arc<dyn Skeleton>,
    identity: usize,
    in_flight: Arc<AtomicUsize>,
}

#[derive(Default)]
struct ExportTable {
    objects: HashMap<ObjectNum, Entry>,
    by_identity: HashMap<usize, ObjectNum>,
}

/// Decrements the in-flight count of one entry when a call finishes.
struct CallGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Publishes local objects under [`RemoteRef`]s and routes incoming calls to
/// them.
///
/// Exporting the same object twice yields the same reference. Object numbers
/// are never reused, so a retracted reference can never reach a newer object.
/// Retraction while calls are executing is rejected unless forced; a forced
/// retraction lets running calls finish but routes no new ones.
pub struct Exporter {
    id: ExporterId,
    config: ExporterConfig,
    endpoint: RwLock<Option<String>>,
    next_object: AtomicU64,
    table: Mutex<ExportTable>,
}

fn identity_of(skeleton: &Arc<dyn Skeleton>) -> usize {
    Arc::as_ptr(skeleton) as *const () as usize
}

impl Exporter {
    pub fn new(config: ExporterConfig) -> Arc<Self> {
        Arc::new(Self {
            id: ExporterId::new(),
            config,
            endpoint: RwLock::new(None),
            next_object: AtomicU64::new(0),
            table: Mutex::new(ExportTable::default()),
        })
    }

    pub fn id(&self) -> ExporterId {
        self.id
    }

    /// Configuration this exporter was created with. Handed to peers that
    /// need to build a compatible exporter of their own.
    pub fn config(&self) -> &ExporterConfig {
        &self.config
    }

    /// Network address peers use to reach this exporter, once hosted.
    pub fn endpoint(&self) -> Option<String> {
        self.endpoint.read().clone()
    }

    pub fn set_endpoint(&self, endpoint: Option<String>) {
        *self.endpoint.write() = endpoint;
    }

    fn reference(&self, object: ObjectNum) -> RemoteRef {
        RemoteRef::new(self.id, object, self.endpoint())
    }

    /// Publish `skeleton` and return its reference.
    pub fn export(&self, skeleton: Arc<dyn Skeleton>) -> RemoteRef {
        let identity = identity_of(&skeleton);
        let mut table = self.table.lock();
        if let Some(&object) = table.by_identity.get(&identity) {
            return self.reference(object);
        }

        let object = ObjectNum(self.next_object.fetch_add(1, Ordering::Relaxed));
        debug!(exporter = %self.id.short_id(), %object, kind = skeleton.kind(), "exported");
        table.by_identity.insert(identity, object);
        table.objects.insert(
            object,
            Entry {
                skeleton,
                identity,
                in_flight: Arc::new(AtomicUsize::new(0)),
            },
        );
        self.reference(object)
    }

    /// Retract a reference.
    ///
    /// Returns `Ok(false)` if it was already retracted. Without `force`, an
    /// object with calls in flight stays exported and
    /// [`ExportError::InFlight`] is returned. An object retracting itself
    /// from inside one of its own calls must pass `force`.
    pub fn unexport(&self, reference: &RemoteRef, force: bool) -> ExportResult<bool> {
        self.check_owner(reference)?;
        let mut table = self.table.lock();
        let Some(entry) = table.objects.get(&reference.object) else {
            return Ok(false);
        };
        let calls = entry.in_flight.load(Ordering::Acquire);
        if calls > 0 && !force {
            return Err(ExportError::InFlight {
                object: reference.object,
                calls,
            });
        }
        if let Some(entry) = table.objects.remove(&reference.object) {
            table.by_identity.remove(&entry.identity);
            debug!(
                exporter = %self.id.short_id(),
                object = %reference.object,
                kind = entry.skeleton.kind(),
                in_flight = calls,
                "unexported"
            );
        }
        Ok(true)
    }

    /// Retract every exported object. Returns how many were retracted.
    ///
    /// Without `force`, nothing is retracted if any object has calls in
    /// flight.
    pub fn unexport_all(&self, force: bool) -> ExportResult<usize> {
        let mut table = self.table.lock();
        if !force {
            let busy = table.objects.iter().find_map(|(object, entry)| {
                let calls = entry.in_flight.load(Ordering::Acquire);
                (calls > 0).then_some((*object, calls))
            });
            if let Some((object, calls)) = busy {
                return Err(ExportError::InFlight { object, calls });
            }
        }
        let count = table.objects.len();
        table.objects.clear();
        table.by_identity.clear();
        debug!(exporter = %self.id.short_id(), count, "unexported all");
        Ok(count)
    }

    /// Release an object whose holder went away: the skeleton tears itself
    /// down, then the reference is retracted. Returns `false` if `reference`
    /// was not exported here.
    pub fn release(&self, reference: &RemoteRef) -> bool {
        if reference.exporter != self.id {
            return false;
        }
        let skeleton = self
            .table
            .lock()
            .objects
            .get(&reference.object)
            .map(|entry| Arc::clone(&entry.skeleton));
        let Some(skeleton) = skeleton else {
            return false;
        };
        debug!(
            exporter = %self.id.short_id(),
            object = %reference.object,
            kind = skeleton.kind(),
            "releasing"
        );
        skeleton.release();
        let _ = self.unexport(reference, true);
        true
    }

    pub fn is_exported(&self, reference: &RemoteRef) -> bool {
        reference.exporter == self.id && self.table.lock().objects.contains_key(&reference.object)
    }

    pub fn exported_count(&self) -> usize {
        self.table.lock().objects.len()
    }

    /// Calls currently executing on `object`.
    pub fn in_flight(&self, object: ObjectNum) -> usize {
        self.table
            .lock()
            .objects
            .get(&object)
            .map_or(0, |entry| entry.in_flight.load(Ordering::Acquire))
    }

    /// Route one incoming call to its object.
    ///
    /// The table lock is released before the object runs, so an object may
    /// export or retract others (or itself) while handling the call.
    pub fn dispatch(&self, object: ObjectNum, call: Call) -> Reply {
        let (skeleton, _guard) = {
            let table = self.table.lock();
            let Some(entry) = table.objects.get(&object) else {
                debug!(exporter = %self.id.short_id(), %object, call = call.name(), "no such object");
                return Reply::Fault(
                    Fault::new(FaultKind::NoSuchObject, format!("{} is not exported", call.name()))
                        .with_subject(object.to_string()),
                );
            };
            entry.in_flight.fetch_add(1, Ordering::AcqRel);
            (
                Arc::clone(&entry.skeleton),
                CallGuard {
                    in_flight: Arc::clone(&entry.in_flight),
                },
            )
        };
        debug!(kind = skeleton.kind(), %object, call = call.name(), "dispatch");
        skeleton.dispatch(call)
    }

    fn check_owner(&self, reference: &RemoteRef) -> ExportResult<()> {
        if reference.exporter != self.id {
            return Err(ExportError::ForeignReference {
                owner: reference.exporter,
                exporter: self.id,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Exporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exporter")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint())
            .field("exported", &self.exported_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbs_protocol::Value;
    use std::sync::mpsc;

    struct Echo;

    impl Skeleton for Echo {
        fn dispatch(&self, call: Call) -> Reply {
            match call {
                Call::Sync => Reply::Ok(Value::Unit),
                other => Reply::Fault(Fault::unsupported_call(&other)),
            }
        }

        fn kind(&self) -> &'static str {
            "echo"
        }
    }

    /// Blocks inside `dispatch` until released.
    struct Gate {
        entered: Mutex<Option<mpsc::Sender<()>>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl Skeleton for Gate {
        fn dispatch(&self, _call: Call) -> Reply {
            if let Some(tx) = self.entered.lock().take() {
                let _ = tx.send(());
            }
            let _ = self.release.lock().recv();
            Reply::Ok(Value::Unit)
        }

        fn kind(&self) -> &'static str {
            "gate"
        }
    }

    fn exporter() -> Arc<Exporter> {
        Exporter::new(ExporterConfig::default())
    }

    // ---- Export ----

    #[test]
    fn export_is_idempotent() {
        let exp = exporter();
        let obj: Arc<dyn Skeleton> = Arc::new(Echo);
        let a = exp.export(Arc::clone(&obj));
        let b = exp.export(obj);
        assert_eq!(a, b);
        assert_eq!(exp.exported_count(), 1);
    }

    #[test]
    fn distinct_objects_get_distinct_refs() {
        let exp = exporter();
        let a = exp.export(Arc::new(Echo));
        let b = exp.export(Arc::new(Echo));
        assert_ne!(a.object, b.object);
        assert_eq!(a.exporter, exp.id());
    }

    #[test]
    fn refs_carry_the_endpoint() {
        let exp = exporter();
        exp.set_endpoint(Some("127.0.0.1:7400".into()));
        let r = exp.export(Arc::new(Echo));
        assert_eq!(r.endpoint.as_deref(), Some("127.0.0.1:7400"));
    }

    // ---- Dispatch ----

    #[test]
    fn dispatch_reaches_the_object() {
        let exp = exporter();
        let r = exp.export(Arc::new(Echo));
        assert_eq!(exp.dispatch(r.object, Call::Sync), Reply::Ok(Value::Unit));
        match exp.dispatch(r.object, Call::CloseStream) {
            Reply::Fault(f) => assert_eq!(f.kind, FaultKind::Unsupported),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn dispatch_to_retracted_object_faults() {
        let exp = exporter();
        let r = exp.export(Arc::new(Echo));
        assert!(exp.unexport(&r, false).unwrap());
        match exp.dispatch(r.object, Call::Sync) {
            Reply::Fault(f) => assert_eq!(f.kind, FaultKind::NoSuchObject),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    /// Counts how often its holder went away.
    #[derive(Default)]
    struct Lease {
        released: AtomicUsize,
    }

    impl Skeleton for Lease {
        fn dispatch(&self, call: Call) -> Reply {
            Reply::Fault(Fault::unsupported_call(&call))
        }

        fn kind(&self) -> &'static str {
            "lease"
        }

        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn release_tears_down_then_retracts() {
        let exp = exporter();
        let lease = Arc::new(Lease::default());
        let r = exp.export(lease.clone());

        assert!(exp.release(&r));
        assert_eq!(lease.released.load(Ordering::SeqCst), 1);
        assert!(!exp.is_exported(&r));

        // Already gone, or not ours: nothing happens.
        assert!(!exp.release(&r));
        let other = exporter().export(Arc::new(Echo));
        assert!(!exp.release(&other));
        assert_eq!(lease.released.load(Ordering::SeqCst), 1);
    }

    // ---- Unexport ----

    #[test]
    fn unexport_twice_is_a_noop() {
        let exp = exporter();
        let r = exp.export(Arc::new(Echo));
        assert!(exp.unexport(&r, false).unwrap());
        assert!(!exp.unexport(&r, false).unwrap());
        assert!(!exp.unexport(&r, true).unwrap());
        assert!(!exp.is_exported(&r));
    }

    #[test]
    fn reexport_after_unexport_gets_a_fresh_number() {
        let exp = exporter();
        let obj: Arc<dyn Skeleton> = Arc::new(Echo);
        let first = exp.export(Arc::clone(&obj));
        exp.unexport(&first, false).unwrap();
        let second = exp.export(obj);
        assert_ne!(first.object, second.object);
    }

    #[test]
    fn foreign_reference_is_rejected() {
        let a = exporter();
        let b = exporter();
        let r = a.export(Arc::new(Echo));
        assert!(matches!(
            b.unexport(&r, true),
            Err(ExportError::ForeignReference { .. })
        ));
        assert!(a.is_exported(&r));
    }

    #[test]
    fn in_flight_calls_block_unforced_unexport() {
        let exp = exporter();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let r = exp.export(Arc::new(Gate {
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(release_rx),
        }));

        let worker = {
            let exp = Arc::clone(&exp);
            let object = r.object;
            std::thread::spawn(move || exp.dispatch(object, Call::Sync))
        };
        entered_rx.recv().unwrap();
        assert_eq!(exp.in_flight(r.object), 1);

        match exp.unexport(&r, false) {
            Err(ExportError::InFlight { calls, .. }) => assert_eq!(calls, 1),
            other => panic!("expected InFlight, got {other:?}"),
        }
        assert!(matches!(exp.unexport_all(false), Err(ExportError::InFlight { .. })));
        assert!(exp.is_exported(&r));

        release_tx.send(()).unwrap();
        assert_eq!(worker.join().unwrap(), Reply::Ok(Value::Unit));
        assert_eq!(exp.in_flight(r.object), 0);
        assert!(exp.unexport(&r, false).unwrap());
    }

    #[test]
    fn forced_unexport_lets_running_call_finish() {
        let exp = exporter();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let r = exp.export(Arc::new(Gate {
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(release_rx),
        }));

        let worker = {
            let exp = Arc::clone(&exp);
            let object = r.object;
            std::thread::spawn(move || exp.dispatch(object, Call::Sync))
        };
        entered_rx.recv().unwrap();
        assert!(exp.unexport(&r, true).unwrap());
        release_tx.send(()).unwrap();
        assert_eq!(worker.join().unwrap(), Reply::Ok(Value::Unit));
        assert!(matches!(exp.dispatch(r.object, Call::Sync), Reply::Fault(_)));
    }

    #[test]
    fn unexport_all_clears_the_table() {
        let exp = exporter();
        let refs: Vec<_> = (0..3).map(|_| exp.export(Arc::new(Echo))).collect();
        assert_eq!(exp.unexport_all(false).unwrap(), 3);
        assert_eq!(exp.exported_count(), 0);
        for r in &refs {
            assert!(!exp.is_exported(r));
        }
    }

    #[test]
    fn debug_format() {
        let exp = exporter();
        let debug = format!("{exp:?}");
        assert!(debug.contains("Exporter"));
        assert!(debug.contains("exported"));
    }
}
