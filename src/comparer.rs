//! Per-argument equality strategies.
//!
//! A memoized method's arguments are stored type-erased inside its
//! [`CallKey`](crate::CallKey). Each declared parameter type is associated
//! with a [`Comparer`] that knows how to compare, hash and print values of that
//! type. Comparers are looked up once, when the method is registered.

use std::any::{Any, TypeId, type_name};
use std::fmt::{self, Debug, Formatter};
use std::hash::Hash;
use std::sync::LazyLock;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;

use crate::error::ConfigError;
use crate::hash::{KeyHasher, hash};

/// A type-erased argument value.
pub type Erased = dyn Any + Send + Sync;

/// The process-wide table of comparers, keyed by argument type.
static COMPARERS: LazyLock<RwLock<FxHashMap<TypeId, Comparer>>> =
    LazyLock::new(|| RwLock::new(builtins()));

/// Register a comparer for its argument type.
///
/// Must happen before any method taking that type is registered.
pub fn register(comparer: Comparer) -> Result<(), ConfigError> {
    let mut table = COMPARERS.write();
    if table.contains_key(&comparer.ty) {
        return Err(ConfigError::DuplicateComparer(comparer.ty_name));
    }
    table.insert(comparer.ty, comparer);
    Ok(())
}

/// Find the comparer for an argument type.
pub fn lookup(ty: TypeId) -> Option<Comparer> {
    COMPARERS.read().get(&ty).copied()
}

/// How a comparer decides equality.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Strategy {
    /// Structural equality through `Eq` and `Hash`.
    Value,
    /// Equality of an entity's identity, ignoring its other fields.
    Identity,
    /// Element-wise equality of an ordered sequence.
    Sequence,
    /// Always equal. For arguments that do not influence the result.
    Ignore,
}

/// Compares, hashes and prints values of one argument type.
#[derive(Copy, Clone)]
pub struct Comparer {
    ty: TypeId,
    ty_name: &'static str,
    strategy: Strategy,
    eq: fn(&Erased, &Erased) -> bool,
    hash: fn(&Erased) -> u128,
    fmt: fn(&Erased, &mut Formatter) -> fmt::Result,
}

impl Comparer {
    /// Compare values of `T` structurally.
    pub fn by_value<T>() -> Self
    where
        T: Eq + Hash + Debug + Send + Sync + 'static,
    {
        Self {
            ty: TypeId::of::<T>(),
            ty_name: type_name::<T>(),
            strategy: Strategy::Value,
            eq: |a, b| match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
            hash: |v| v.downcast_ref::<T>().map_or(0, hash),
            fmt: |v, f| match v.downcast_ref::<T>() {
                Some(v) => Debug::fmt(v, f),
                None => f.pad("?"),
            },
        }
    }

    /// Compare entities of `T` by their identity.
    pub fn by_identity<T: Identity>() -> Self {
        Self {
            ty: TypeId::of::<T>(),
            ty_name: type_name::<T>(),
            strategy: Strategy::Identity,
            eq: |a, b| match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
                (Some(a), Some(b)) => a.identity() == b.identity(),
                _ => false,
            },
            hash: |v| v.downcast_ref::<T>().map_or(0, |v| hash(&v.identity())),
            fmt: |v, f| match v.downcast_ref::<T>() {
                Some(v) => write!(f, "#{:?}", v.identity()),
                None => f.pad("?"),
            },
        }
    }

    /// Compare `Vec<E>` arguments element by element, in order.
    pub fn by_sequence<E>() -> Self
    where
        E: Eq + Hash + Debug + Send + Sync + 'static,
    {
        Self {
            ty: TypeId::of::<Vec<E>>(),
            ty_name: type_name::<Vec<E>>(),
            strategy: Strategy::Sequence,
            eq: |a, b| match (a.downcast_ref::<Vec<E>>(), b.downcast_ref::<Vec<E>>()) {
                (Some(a), Some(b)) => {
                    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
                }
                _ => false,
            },
            hash: |v| {
                let Some(items) = v.downcast_ref::<Vec<E>>() else { return 0 };
                let mut state = KeyHasher::new();
                state.write_u64(items.len() as u64);
                for item in items {
                    state.write_u128(hash(item));
                }
                state.finish()
            },
            fmt: |v, f| match v.downcast_ref::<Vec<E>>() {
                Some(v) => f.debug_list().entries(v).finish(),
                None => f.pad("?"),
            },
        }
    }

    /// Treat all values of `T` as equal.
    pub fn ignore<T: Send + Sync + 'static>() -> Self {
        Self {
            ty: TypeId::of::<T>(),
            ty_name: type_name::<T>(),
            strategy: Strategy::Ignore,
            eq: |_, _| true,
            hash: |_| 0,
            fmt: |_, f| f.pad("_"),
        }
    }

    /// The argument type this comparer handles.
    pub fn arg_type_id(&self) -> TypeId {
        self.ty
    }

    /// The name of the argument type.
    pub fn type_name(&self) -> &'static str {
        self.ty_name
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    #[inline]
    pub fn eq(&self, a: &Erased, b: &Erased) -> bool {
        (self.eq)(a, b)
    }

    #[inline]
    pub fn hash(&self, value: &Erased) -> u128 {
        (self.hash)(value)
    }

    /// Print an argument through this comparer's view of it.
    pub fn fmt_arg(&self, value: &Erased, f: &mut Formatter) -> fmt::Result {
        (self.fmt)(value, f)
    }
}

impl Debug for Comparer {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "Comparer({:?}, {})", self.strategy, self.ty_name)
    }
}

/// An entity whose identity, not its contents, makes it a cache key.
pub trait Identity: Send + Sync + 'static {
    type Id: Eq + Hash + Debug;

    fn identity(&self) -> Self::Id;
}

fn builtins() -> FxHashMap<TypeId, Comparer> {
    let mut table = FxHashMap::default();
    let mut add = |comparer: Comparer| {
        table.insert(comparer.ty, comparer);
    };

    macro_rules! by_value {
        ($($ty:ty),* $(,)?) => {
            $(add(Comparer::by_value::<$ty>());)*
        };
    }

    by_value! {
        (), bool, char,
        u8, u16, u32, u64, u128, usize,
        i8, i16, i32, i64, i128, isize,
        String, &'static str,
    }

    add(Comparer::by_sequence::<u8>());
    add(Comparer::by_sequence::<String>());
    add(Comparer::ignore::<CancellationToken>());
    table
}
