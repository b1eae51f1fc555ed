use std::any::{Any, TypeId, type_name};
use std::fmt::{self, Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, LazyLock, OnceLock};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::comparer::{self, Comparer, Erased};
use crate::error::ConfigError;
use crate::hash::KeyHasher;
use crate::options::ComputedOptions;

/// All registered methods, by name.
static METHODS: LazyLock<RwLock<FxHashMap<String, Arc<Method>>>> =
    LazyLock::new(|| RwLock::new(FxHashMap::default()));

/// The id of the next registered method.
static NEXT_METHOD: AtomicU32 = AtomicU32::new(1);

/// Erase an argument value for use in a [`CallKey`].
pub fn arg<T: Send + Sync + 'static>(value: T) -> Arc<Erased> {
    Arc::new(value)
}

/// The declared type of a method parameter.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ArgType {
    id: TypeId,
    name: &'static str,
}

impl ArgType {
    pub fn of<T: Any>() -> Self {
        Self { id: TypeId::of::<T>(), name: type_name::<T>() }
    }
}

/// A memoizable method: its name, its parameters' comparers and its options.
///
/// Methods are registered once and live for the rest of the process.
pub struct Method {
    id: u32,
    name: String,
    params: Box<[Comparer]>,
    options: ComputedOptions,
}

impl Method {
    /// Register a method.
    ///
    /// Resolves a comparer for every parameter type up front so that calls
    /// can never fail on an unsupported argument.
    pub fn register(
        name: impl Into<String>,
        params: &[ArgType],
        options: ComputedOptions,
    ) -> Result<Arc<Self>, ConfigError> {
        let name = name.into();
        let params = params
            .iter()
            .enumerate()
            .map(|(index, ty)| {
                comparer::lookup(ty.id).ok_or_else(|| ConfigError::UnsupportedArgument {
                    method: name.clone(),
                    index,
                    ty: ty.name,
                })
            })
            .collect::<Result<Box<[_]>, _>>()?;

        let mut methods = METHODS.write();
        if methods.contains_key(&name) {
            return Err(ConfigError::DuplicateMethod(name));
        }

        let method = Arc::new(Self {
            id: NEXT_METHOD.fetch_add(1, Ordering::Relaxed),
            name: name.clone(),
            params,
            options,
        });

        methods.insert(name, method.clone());
        Ok(method)
    }

    /// Find a registered method by name.
    pub fn lookup(name: &str) -> Option<Arc<Self>> {
        METHODS.read().get(name).cloned()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The comparers of the method's parameters, in order.
    pub fn params(&self) -> &[Comparer] {
        &self.params
    }

    pub fn options(&self) -> &ComputedOptions {
        &self.options
    }
}

impl Debug for Method {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("options", &self.options)
            .finish()
    }
}

/// Lazily registers a method on first use.
///
/// Generated wrappers keep one of these in a static.
pub struct MethodCell(OnceLock<Arc<Method>>);

impl MethodCell {
    pub const fn new() -> Self {
        Self(OnceLock::new())
    }

    /// Return the method, registering it if this is the first call.
    ///
    /// Panics if registration fails, as that is a setup error in the program.
    pub fn get_or_register<F>(&self, register: F) -> &Arc<Method>
    where
        F: FnOnce() -> Result<Arc<Method>, ConfigError>,
    {
        self.0.get_or_init(|| match register() {
            Ok(method) => method,
            Err(err) => panic!("memograph: {err}"),
        })
    }
}

impl Default for MethodCell {
    fn default() -> Self {
        Self::new()
    }
}

/// The service instance a memoized method is invoked on.
///
/// Targets compare by identity. Free functions have no target.
#[derive(Clone)]
pub struct Target(Option<(Arc<Erased>, &'static str)>);

impl Target {
    pub fn none() -> Self {
        Self(None)
    }

    /// Target a service. The key keeps the service alive.
    pub fn of<T: Send + Sync + 'static>(service: &Arc<T>) -> Self {
        let erased: Arc<Erased> = service.clone();
        Self(Some((erased, type_name::<T>())))
    }

    /// The service, if it is a `T`.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.0.as_ref()?.0.downcast_ref()
    }

    fn addr(&self) -> usize {
        self.0
            .as_ref()
            .map_or(0, |(service, _)| Arc::as_ptr(service) as *const () as usize)
    }
}

impl Debug for Target {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match &self.0 {
            Some((_, name)) => write!(f, "{name}@{:#x}", self.addr()),
            None => f.pad("none"),
        }
    }
}

/// Identifies one memoizable call: target, method and arguments.
///
/// The key's hash is computed once on construction. Cloning is cheap.
#[derive(Clone)]
pub struct CallKey(Arc<Repr>);

struct Repr {
    target: Target,
    method: Arc<Method>,
    args: Box<[Arc<Erased>]>,
    hash: u128,
}

impl CallKey {
    /// Build a key.
    ///
    /// Panics if the arguments do not match the method's declared parameters,
    /// which indicates a bug in the code forwarding the call.
    pub fn new(target: Target, method: Arc<Method>, args: Vec<Arc<Erased>>) -> Self {
        assert_eq!(
            args.len(),
            method.params.len(),
            "memograph: `{}` called with the wrong number of arguments",
            method.name,
        );

        let mut state = KeyHasher::new();
        state.write_u64(method.id as u64);
        state.write_u64(target.addr() as u64);
        for (index, (arg, cmp)) in args.iter().zip(method.params.iter()).enumerate() {
            assert!(
                (**arg).type_id() == cmp.arg_type_id(),
                "memograph: argument {index} of `{}` is not a `{}`",
                method.name,
                cmp.type_name(),
            );
            state.write_u128(cmp.hash(&**arg));
        }

        let hash = state.finish();
        Self(Arc::new(Repr { target, method, args: args.into(), hash }))
    }

    pub fn target(&self) -> &Target {
        &self.0.target
    }

    pub fn method(&self) -> &Arc<Method> {
        &self.0.method
    }

    pub fn args(&self) -> &[Arc<Erased>] {
        &self.0.args
    }

    /// The argument at `index`, if it is a `T`.
    pub fn arg<T: Send + Sync + 'static>(&self, index: usize) -> Option<&T> {
        self.0.args.get(index)?.downcast_ref()
    }

    /// The key's precomputed 128-bit hash.
    pub fn hash128(&self) -> u128 {
        self.0.hash
    }
}

impl PartialEq for CallKey {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (&*self.0, &*other.0);
        Arc::ptr_eq(&self.0, &other.0)
            || (a.hash == b.hash
                && a.method.id == b.method.id
                && a.target.addr() == b.target.addr()
                && a.method
                    .params
                    .iter()
                    .zip(a.args.iter().zip(b.args.iter()))
                    .all(|(cmp, (x, y))| cmp.eq(&**x, &**y)))
    }
}

impl Eq for CallKey {}

impl Hash for CallKey {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u128(self.0.hash);
    }
}

impl Debug for CallKey {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        struct Arg<'a>(&'a Comparer, &'a Erased);

        impl Debug for Arg<'_> {
            fn fmt(&self, f: &mut Formatter) -> fmt::Result {
                self.0.fmt_arg(self.1, f)
            }
        }

        let mut tuple = f.debug_tuple(&self.0.method.name);
        for (cmp, arg) in self.0.method.params.iter().zip(self.0.args.iter()) {
            tuple.field(&Arg(cmp, &**arg));
        }
        tuple.finish()
    }
}
