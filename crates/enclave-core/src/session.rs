//! Scoped access to one instance.
//!
//! A [`Session`] occupies its instance from creation until it is dropped. All
//! traffic with the instance goes through it: values are imported (claiming
//! their tensors) and results copied back out. Objects it hands out are
//! [`Obj`] handles that borrow the session and cannot outlive it.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use crate::engine::ObjId;
use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::pool::{InstanceSlot, PoolInner, Ticket, UsageGuard};
use crate::replicated::{Recipe, ReplicatedObject};
use crate::tag::InstanceId;
use crate::value::{Kwargs, Value};

/// Exclusive, scoped access to one instance.
///
/// Several sessions may target the same instance from the same thread (nested
/// or one after another). A session on an instance another thread occupies
/// waits for it.
pub struct Session<'a> {
    slot: Arc<InstanceSlot>,
    id: InstanceId,
    this: ObjId,
    pool: Weak<PoolInner>,
    temporaries: RefCell<Vec<ObjId>>,
    _ticket: Ticket,
    _usage: UsageGuard,
    _scope: PhantomData<(&'a (), *const ())>,
}

impl<'a> Session<'a> {
    /// Open a session whose `self_obj` is chosen by `this`.
    pub(crate) fn open(
        pool: Weak<PoolInner>,
        usage: UsageGuard,
        ticket: Ticket,
        this: impl FnOnce(&mut Instance) -> Result<ObjId>,
    ) -> Result<Self> {
        let slot = ticket.slot().clone();
        let (id, this) = slot.with_current(|instance| Ok((instance.id(), this(instance)?)))?;
        tracing::debug!("session opened on {}", id);
        Ok(Self {
            slot,
            id,
            this,
            pool,
            temporaries: RefCell::new(Vec::new()),
            _ticket: ticket,
            _usage: usage,
            _scope: PhantomData,
        })
    }

    /// A session rooted at the instance's top-level namespace.
    pub(crate) fn on_root(pool: &Arc<PoolInner>, usage: UsageGuard, ticket: Ticket) -> Result<Self> {
        Self::open(Arc::downgrade(pool), usage, ticket, |instance| Ok(instance.root()))
    }

    /// Identity of the instance this session occupies.
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Pool slot of the instance.
    pub fn index(&self) -> usize {
        self.id.slot()
    }

    /// The object this session was opened on: a package importer, a
    /// replicated object's copy in this instance, or the root namespace.
    pub fn self_obj(&self) -> Obj<'_> {
        Obj {
            session: self,
            id: self.this,
        }
    }

    /// Attribute `name` of [`Session::self_obj`].
    pub fn attr(&self, name: &str) -> Result<Obj<'_>> {
        self.self_obj().attr(name)
    }

    /// Look up `module.name` in the instance's top-level namespace.
    pub fn global(&self, module: &str, name: &str) -> Result<Obj<'_>> {
        let root = self.with(|instance| Ok(instance.root()))?;
        let module = self.allocate(|instance| instance.attr(root, module))?;
        module.attr(name)
    }

    /// Import `value` into the instance.
    ///
    /// Untagged tensors inside it are claimed for this instance. A tensor
    /// owned by another instance fails with `TagMismatch` and nothing is
    /// imported.
    pub fn from_value(&self, value: impl Into<Value>) -> Result<Obj<'_>> {
        let value = value.into();
        self.allocate(|instance| instance.import_external(value))
    }

    /// Capture `object` so it can be materialized in every instance.
    ///
    /// Only the recipe is taken here; copies are built lazily, one per
    /// instance, on first access.
    pub fn create_movable(&self, object: &Obj<'_>) -> Result<ReplicatedObject> {
        self.check_same_instance(object)?;
        let pickled = self.with(|instance| instance.pickle(object.id))?;
        let pool = self
            .pool
            .upgrade()
            .ok_or_else(|| Error::UseAfterDestroy("pool was destroyed".to_string()))?;
        let eligible: Vec<usize> = (0..pool.size()).collect();
        Ok(ReplicatedObject::new(
            Arc::downgrade(&pool),
            Recipe::Pickled(pickled),
            eligible,
            None,
        ))
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut Instance) -> Result<R>) -> Result<R> {
        self.slot.with_instance(self.id, f)
    }

    /// Run `f` to produce a new heap object owned by this session.
    fn allocate(&self, f: impl FnOnce(&mut Instance) -> Result<ObjId>) -> Result<Obj<'_>> {
        let id = self.with(f)?;
        self.temporaries.borrow_mut().push(id);
        Ok(Obj { session: self, id })
    }

    fn check_same_instance(&self, object: &Obj<'_>) -> Result<()> {
        if object.session.id == self.id {
            Ok(())
        } else {
            Err(Error::TagMismatch {
                owner: object.session.id,
                requester: self.id,
            })
        }
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        let objects = std::mem::take(self.temporaries.get_mut());
        if objects.is_empty() {
            return;
        }
        let released = objects.len();
        if let Err(e) = self.with(|instance| {
            for object in objects {
                instance.release(object);
            }
            Ok(())
        }) {
            tracing::debug!("skipping release of {} object(s): {}", released, e);
        }
    }
}

impl fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("this", &self.this)
            .finish()
    }
}

/// Handle to an object on an instance heap.
#[derive(Clone, Copy)]
pub struct Obj<'s> {
    session: &'s Session<'s>,
    id: ObjId,
}

impl<'s> Obj<'s> {
    pub fn id(&self) -> ObjId {
        self.id
    }

    pub fn attr(&self, name: &str) -> Result<Obj<'s>> {
        let this = self.id;
        self.session.allocate(|instance| instance.attr(this, name))
    }

    /// Call this object with heap arguments from the same instance.
    pub fn call(&self, args: &[Obj<'_>]) -> Result<Obj<'s>> {
        for arg in args {
            self.session.check_same_instance(arg)?;
        }
        let callable = self.id;
        let args: Vec<ObjId> = args.iter().map(|arg| arg.id).collect();
        self.session
            .allocate(|instance| instance.call(callable, &args, &[]))
    }

    /// Call this object with positional values imported from the host.
    pub fn call_values(&self, args: &[Value]) -> Result<Obj<'s>> {
        self.call_kwargs(args, &Kwargs::default())
    }

    /// Call this object with positional and keyword values from the host.
    pub fn call_kwargs(&self, args: &[Value], kwargs: &Kwargs) -> Result<Obj<'s>> {
        let callable = self.id;
        let args = args.to_vec();
        let kwargs: Vec<(String, Value)> = kwargs
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let result = self.session.with(|instance| {
            let mut imported = Vec::with_capacity(args.len() + kwargs.len());
            let outcome = (|| {
                let mut positional = Vec::with_capacity(args.len());
                for value in args {
                    let id = instance.import_external(value)?;
                    imported.push(id);
                    positional.push(id);
                }
                let mut keywords = Vec::with_capacity(kwargs.len());
                for (name, value) in kwargs {
                    let id = instance.import_external(value)?;
                    imported.push(id);
                    keywords.push((name, id));
                }
                instance.call(callable, &positional, &keywords)
            })();
            for id in imported {
                instance.release(id);
            }
            outcome
        })?;
        self.session.temporaries.borrow_mut().push(result);
        Ok(Obj {
            session: self.session,
            id: result,
        })
    }

    /// Copy the object's value out of the instance.
    pub fn to_value(&self) -> Result<Value> {
        let id = self.id;
        self.session.with(|instance| instance.value_of(id))
    }
}

impl fmt::Debug for Obj<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}", self.id, self.session.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;
    use crate::tensor::Tensor;

    #[test]
    fn test_global_builtin_call() {
        let pool = Pool::new(1).unwrap();
        let session = pool.acquire_one().unwrap();
        let zeros = session.global("tensor", "zeros").unwrap();
        let out = zeros.call_values(&[Value::Int(2), Value::Int(3)]).unwrap();
        let t = out.to_value().unwrap().into_tensor().unwrap();
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.owner(), Some(session.id()));
    }

    #[test]
    fn test_heap_call_with_objects() {
        let pool = Pool::new(1).unwrap();
        let session = pool.acquire_session(0).unwrap();
        let add = session.global("tensor", "add").unwrap();
        let a = session.from_value(Tensor::ones(&[2]).unwrap()).unwrap();
        let b = session.from_value(Tensor::ones(&[2]).unwrap()).unwrap();
        let sum = add.call(&[a, b]).unwrap().to_value().unwrap();
        assert_eq!(sum.into_tensor().unwrap().data(), &[2.0, 2.0]);
    }

    #[test]
    fn test_obj_from_other_instance_rejected() {
        let pool = Pool::new(2).unwrap();
        let first = pool.acquire_session(0).unwrap();
        let second = pool.acquire_session(1).unwrap();
        let relu = second.global("tensor", "relu").unwrap();
        let foreign = first.from_value(Tensor::ones(&[1]).unwrap()).unwrap();
        assert!(matches!(
            relu.call(&[foreign]),
            Err(Error::TagMismatch { .. })
        ));
    }

    #[test]
    fn test_temporaries_released_on_drop() {
        let pool = Pool::new(1).unwrap();
        let baseline = {
            let session = pool.acquire_one().unwrap();
            session.with(|i| Ok(i.live_objects())).unwrap()
        };
        {
            let session = pool.acquire_one().unwrap();
            let ones = session.global("tensor", "ones").unwrap();
            ones.call_values(&[Value::Int(4)]).unwrap();
            session.from_value(Value::Int(1)).unwrap();
        }
        let session = pool.acquire_one().unwrap();
        assert_eq!(session.with(|i| Ok(i.live_objects())).unwrap(), baseline);
    }

    #[test]
    fn test_nested_sessions_same_instance() {
        let pool = Pool::new(1).unwrap();
        let outer = pool.acquire_session(0).unwrap();
        let inner = pool.acquire_session(0).unwrap();
        assert_eq!(outer.id(), inner.id());
        let t = inner
            .global("tensor", "ones")
            .unwrap()
            .call_values(&[Value::Int(1)])
            .unwrap()
            .to_value()
            .unwrap();
        outer.from_value(t).unwrap();
    }

    #[test]
    fn test_failed_call_leaves_no_imports() {
        let pool = Pool::new(1).unwrap();
        let session = pool.acquire_one().unwrap();
        let relu = session.global("nn", "ReLU").unwrap().call(&[]).unwrap();
        let before = session.with(|i| Ok(i.live_objects())).unwrap();
        assert!(matches!(
            relu.call_values(&[Value::from("unexpected input")]),
            Err(Error::InvocationFailure(_))
        ));
        assert_eq!(session.with(|i| Ok(i.live_objects())).unwrap(), before);
    }
}
