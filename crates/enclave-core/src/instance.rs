//! One isolated execution instance.
//!
//! An `Instance` owns a private heap and the importers of the packages loaded
//! into it. It is never touched directly by callers: the pool keeps it inside
//! a slot and sessions reach it only while they hold that slot.

use rustc_hash::FxHashMap;

use crate::engine::archive::Archive;
use crate::engine::pickle::{self, Pickled};
use crate::engine::protocol::{Command, Response};
use crate::engine::{
    Ctx, FORWARD_PARAM, Heap, Method, Module, Namespace, ObjId, Slot, lookup_builtin,
};
use crate::error::{Error, Result};
use crate::package::PackageId;
use crate::tag::{InstanceId, Liveness};
use crate::tensor::Tensor;
use crate::value::Value;

struct Importer {
    archive: Archive,
    object: ObjId,
}

/// Engine state of one instance.
pub(crate) struct Instance {
    liveness: Liveness,
    id: InstanceId,
    heap: Heap,
    root: ObjId,
    packages: FxHashMap<PackageId, Importer>,
}

impl Instance {
    /// Construct the instance for `slot` with a fresh build id.
    pub(crate) fn new(slot: usize) -> Self {
        let id = InstanceId::next(slot);
        let mut heap = Heap::new();
        let root = heap.insert(Slot::Namespace(Namespace::Root));
        tracing::debug!("created {}", id);
        Self {
            liveness: Liveness::new(id),
            id,
            heap,
            root,
            packages: FxHashMap::default(),
        }
    }

    pub(crate) fn id(&self) -> InstanceId {
        self.id
    }

    /// The root namespace object.
    pub(crate) fn root(&self) -> ObjId {
        self.root
    }

    /// Importer object of a loaded package.
    pub(crate) fn importer(&self, package: PackageId) -> Option<ObjId> {
        self.packages.get(&package).map(|importer| importer.object)
    }

    #[cfg(test)]
    pub(crate) fn has_package(&self, package: PackageId) -> bool {
        self.packages.contains_key(&package)
    }

    #[cfg(test)]
    pub(crate) fn package_count(&self) -> usize {
        self.packages.len()
    }

    /// Number of live heap objects.
    #[cfg(test)]
    pub(crate) fn live_objects(&self) -> usize {
        self.heap.len()
    }

    fn ctx(&self) -> Ctx {
        Ctx::new(self.liveness.owner())
    }

    /// Run a command.
    pub(crate) fn run(&mut self, command: Command) -> Result<Response> {
        match command {
            Command::LoadPackage { package, root } => {
                if self.packages.contains_key(&package) {
                    return Ok(Response::Done);
                }
                let archive = Archive::open(&root)?;
                let object = self.heap.insert(Slot::Importer(package));
                self.packages.insert(package, Importer { archive, object });
                Ok(Response::Done)
            }
            Command::UnloadPackage { package } => {
                if let Some(importer) = self.packages.remove(&package) {
                    self.heap.remove(importer.object);
                }
                Ok(Response::Done)
            }
            Command::LoadPickle { package, key, name } => {
                let id = self.load_pickle(package, &key, &name)?;
                Ok(Response::Object(id))
            }
            Command::Unpickle { data } => {
                let slot = pickle::unpickle(&self.ctx(), &data)?;
                Ok(Response::Object(self.heap.insert(slot)))
            }
            Command::Release { objects } => {
                for id in objects {
                    self.release(id);
                }
                Ok(Response::Done)
            }
        }
    }

    fn load_pickle(&mut self, package: PackageId, key: &str, name: &str) -> Result<ObjId> {
        let importer = self.packages.get(&package).ok_or_else(|| {
            Error::load(format!("package {} is not loaded in {}", package, self.id))
        })?;
        let pickled = importer.archive.read(key, name)?;
        let slot = pickle::unpickle(&self.ctx(), &pickled)?;
        Ok(self.heap.insert(slot))
    }

    /// Bring an external value into this instance.
    ///
    /// Every tensor inside is claimed for this instance first; a tensor owned
    /// by any other instance fails the whole import before anything lands on
    /// the heap.
    pub(crate) fn import_external(&mut self, value: Value) -> Result<ObjId> {
        self.ctx().claim(&value)?;
        Ok(self.heap.insert(Slot::Value(value)))
    }

    /// Call `callable` with heap arguments.
    pub(crate) fn call(
        &mut self,
        callable: ObjId,
        args: &[ObjId],
        kwargs: &[(String, ObjId)],
    ) -> Result<ObjId> {
        let ctx = self.ctx();
        let slot = {
            let target = self.heap.get(callable)?;
            let arg_slots = args
                .iter()
                .map(|&id| self.heap.get(id))
                .collect::<Result<Vec<_>>>()?;

            match target {
                Slot::Builtin(builtin) => {
                    if let Some((name, _)) = kwargs.first() {
                        return Err(Error::invocation(format!(
                            "{:?} got an unexpected keyword argument '{}'",
                            builtin, name
                        )));
                    }
                    builtin.call(&ctx, &arg_slots)?
                }
                Slot::Module(module) | Slot::Method(Method::Forward(module)) => {
                    let input = self.forward_input(module, &arg_slots, kwargs)?;
                    Slot::Value(Value::Tensor(module.forward(&ctx, input)?))
                }
                Slot::Method(Method::LoadPickle(package)) => {
                    let package = *package;
                    let (key, name) = match (arg_slots.as_slice(), kwargs) {
                        ([Slot::Value(Value::Str(key)), Slot::Value(Value::Str(name))], []) => {
                            (key.clone(), name.clone())
                        }
                        _ => {
                            return Err(Error::invocation(
                                "load_pickle expects (key: str, name: str)",
                            ));
                        }
                    };
                    return self.load_pickle(package, &key, &name);
                }
                other => {
                    return Err(Error::invocation(format!(
                        "{} object is not callable",
                        other.type_name()
                    )));
                }
            }
        };
        Ok(self.heap.insert(slot))
    }

    fn forward_input<'h>(
        &'h self,
        module: &Module,
        args: &[&'h Slot],
        kwargs: &[(String, ObjId)],
    ) -> Result<&'h Tensor> {
        let mut input = None;
        if let Some(extra) = kwargs.iter().find(|(name, _)| name != FORWARD_PARAM) {
            return Err(Error::invocation(format!(
                "{}.forward got an unexpected keyword argument '{}'",
                module.class(),
                extra.0
            )));
        }
        match (args, kwargs) {
            ([positional], []) => input = Some(*positional),
            ([], [(_, id)]) => input = Some(self.heap.get(*id)?),
            _ => {}
        }
        match input {
            Some(Slot::Value(Value::Tensor(t))) => Ok(t),
            Some(other) => Err(Error::invocation(format!(
                "{}.forward expects a tensor, got {}",
                module.class(),
                other.type_name()
            ))),
            None => Err(Error::invocation(format!(
                "{}.forward takes exactly one argument '{}' ({} positional, {} keyword given)",
                module.class(),
                FORWARD_PARAM,
                args.len(),
                kwargs.len()
            ))),
        }
    }

    /// Attribute `name` of `object`, allocated as a new heap object.
    pub(crate) fn attr(&mut self, object: ObjId, name: &str) -> Result<ObjId> {
        let found = match self.heap.get(object)? {
            Slot::Namespace(Namespace::Root) => {
                Namespace::from_name(name).map(Slot::Namespace)
            }
            Slot::Namespace(ns) => lookup_builtin(*ns, name).map(Slot::Builtin),
            Slot::Importer(package) if name == "load_pickle" => {
                Some(Slot::Method(Method::LoadPickle(*package)))
            }
            Slot::Module(module) => Module::attr(module, name),
            Slot::Value(Value::Tensor(t)) if name == "shape" => Some(Slot::Value(Value::Tuple(
                t.shape().iter().map(|&d| Value::Int(d as i64)).collect(),
            ))),
            _ => None,
        };
        let slot = found.ok_or_else(|| {
            let owner = self
                .heap
                .get(object)
                .map(Slot::type_name)
                .unwrap_or("object");
            Error::invocation(format!("{} has no attribute '{}'", owner, name))
        })?;
        Ok(self.heap.insert(slot))
    }

    /// Copy a heap value out to the caller.
    pub(crate) fn value_of(&self, object: ObjId) -> Result<Value> {
        match self.heap.get(object)? {
            Slot::Value(value) => Ok(value.clone()),
            other => Err(Error::invocation(format!(
                "{} has no value representation",
                other.type_name()
            ))),
        }
    }

    /// Portable form of a heap object.
    pub(crate) fn pickle(&self, object: ObjId) -> Result<Pickled> {
        pickle::pickle(self.heap.get(object)?)
    }

    /// Release one heap object. Pinned roots are never released.
    pub(crate) fn release(&mut self, object: ObjId) {
        if object != self.root {
            self.heap.remove(object);
        }
    }

    /// Tear the instance down.
    ///
    /// Dropping the liveness token turns every tag naming this instance stale;
    /// a later claim against such a tag reports `UseAfterDestroy`.
    pub(crate) fn destroy(self) {
        tracing::debug!(
            "destroying {} ({} live objects, {} packages)",
            self.id,
            self.heap.len(),
            self.packages.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::archive::PackageWriter;
    use tempfile::TempDir;

    fn global(instance: &mut Instance, module: &str, name: &str) -> ObjId {
        let ns = instance.attr(instance.root(), module).unwrap();
        instance.attr(ns, name).unwrap()
    }

    #[test]
    fn test_builtin_call() {
        let mut instance = Instance::new(0);
        let ones = global(&mut instance, "tensor", "ones");
        let dim = instance.import_external(Value::Int(3)).unwrap();
        let out = instance.call(ones, &[dim], &[]).unwrap();

        let t = instance.value_of(out).unwrap().into_tensor().unwrap();
        assert!(t.equal(&Tensor::ones(&[3]).unwrap()));
        assert_eq!(t.owner(), Some(instance.id()));
    }

    #[test]
    fn test_import_claims_untagged_tensor() {
        let mut instance = Instance::new(0);
        let t = Tensor::ones(&[2]).unwrap();
        instance.import_external(Value::Tensor(t.clone())).unwrap();
        assert_eq!(t.owner(), Some(instance.id()));
    }

    #[test]
    fn test_import_rejects_foreign_tensor() {
        let mut a = Instance::new(0);
        let mut b = Instance::new(1);
        let t = Tensor::ones(&[2]).unwrap();
        a.import_external(Value::Tensor(t.clone())).unwrap();

        let before = b.live_objects();
        let err = b
            .import_external(Value::Tuple(vec![Value::Int(1), Value::Tensor(t)]))
            .unwrap_err();
        assert!(matches!(err, Error::TagMismatch { .. }));
        assert_eq!(b.live_objects(), before);
    }

    #[test]
    fn test_destroyed_owner() {
        let t = Tensor::ones(&[2]).unwrap();
        let mut old = Instance::new(0);
        old.import_external(Value::Tensor(t.clone())).unwrap();
        old.destroy();

        let mut successor = Instance::new(0);
        assert!(matches!(
            successor.import_external(Value::Tensor(t)),
            Err(Error::UseAfterDestroy(_))
        ));
    }

    #[test]
    fn test_kwargs_forward() {
        let mut instance = Instance::new(0);
        let sigmoid = global(&mut instance, "nn", "Sigmoid");
        let module = instance.call(sigmoid, &[], &[]).unwrap();
        let input = instance.import_external(Value::Tensor(Tensor::zeros(&[2]).unwrap())).unwrap();

        let out = instance
            .call(module, &[], &[("input".to_string(), input)])
            .unwrap();
        let t = instance.value_of(out).unwrap().into_tensor().unwrap();
        assert_eq!(t.data(), &[0.5, 0.5]);

        let err = instance
            .call(module, &[], &[("x".to_string(), input)])
            .unwrap_err();
        assert!(matches!(err, Error::InvocationFailure(_)));
        assert!(instance.call(module, &[input, input], &[]).is_err());
    }

    #[test]
    fn test_non_tensor_input_rejected() {
        let mut instance = Instance::new(0);
        let relu = global(&mut instance, "nn", "ReLU");
        let module = instance.call(relu, &[], &[]).unwrap();
        let junk = instance.import_external(Value::from("unexpected input")).unwrap();
        assert!(matches!(
            instance.call(module, &[junk], &[]),
            Err(Error::InvocationFailure(_))
        ));
    }

    #[test]
    fn test_package_load_and_pickle() {
        let temp = TempDir::new().unwrap();
        let mut writer = PackageWriter::create(temp.path()).unwrap();
        writer
            .add("model", "model.pkl", &Pickled::module("nn.ReLU"))
            .unwrap();
        let root = writer.finish().unwrap();

        let mut instance = Instance::new(0);
        let package = PackageId::new();
        instance
            .run(Command::LoadPackage { package, root })
            .unwrap();
        let importer = instance.importer(package).unwrap();
        let loader = instance.attr(importer, "load_pickle").unwrap();
        let key = instance.import_external(Value::from("model")).unwrap();
        let name = instance.import_external(Value::from("model.pkl")).unwrap();
        let model = instance.call(loader, &[key, name], &[]).unwrap();
        assert_eq!(instance.pickle(model).unwrap(), Pickled::module("nn.ReLU"));

        let missing = instance.run(Command::LoadPickle {
            package,
            key: "some other".to_string(),
            name: "garbage path".to_string(),
        });
        assert!(matches!(missing, Err(Error::LoadFailure(_))));

        instance
            .run(Command::UnloadPackage { package })
            .unwrap();
        assert!(instance.importer(package).is_none());
    }

    #[test]
    fn test_missing_attribute() {
        let mut instance = Instance::new(0);
        let root = instance.root();
        assert!(matches!(
            instance.attr(root, "nonexistent"),
            Err(Error::InvocationFailure(_))
        ));
    }
}
