extern crate proc_macro;

macro_rules! bail {
    ($item:expr, $fmt:literal $($tts:tt)*) => {
        return Err(Error::new_spanned(
            &$item,
            format!(concat!("memograph: ", $fmt) $($tts)*)
        ))
    }
}

mod computed;
mod utils;

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{Error, Result};

/// Memoize an async function or method.
///
/// The function must return `memograph::Result<T>` with a clonable `T`.
/// Methods take their receiver as `self: &Arc<Self>` so that the service can
/// be part of the call key. Every argument type must have a registered
/// comparer.
///
/// ```ignore
/// impl Users {
///     #[computed(keep_alive_ms = 1000)]
///     async fn get(self: &Arc<Self>, id: u64) -> memograph::Result<User> {
///         self.db.load(id).await.map_err(memograph::Error::compute)
///     }
/// }
/// ```
///
/// Supported options, all in milliseconds:
/// - `keep_alive_ms`: how long an instance stays cached after its last use
/// - `invalidation_delay_ms`: delay before dependents are invalidated
/// - `auto_invalidate_ms`: invalidate instances this long after they settle
/// - `transient_error_ms`: how long transient errors stay cached
#[proc_macro_attribute]
pub fn computed(attr: TokenStream, stream: TokenStream) -> TokenStream {
    let options = syn::parse_macro_input!(attr as utils::Options);
    let func = syn::parse_macro_input!(stream as syn::ItemFn);
    computed::expand(options, func)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}
