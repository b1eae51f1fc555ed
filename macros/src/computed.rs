use super::*;
use crate::utils::Options;

/// Memoize an async function or method.
pub fn expand(options: Options, func: syn::ItemFn) -> Result<proc_macro2::TokenStream> {
    if func.sig.asyncness.is_none() {
        bail!(func.sig.fn_token, "only async functions can be memoized");
    }

    if !func.sig.generics.params.is_empty() {
        bail!(func.sig.generics, "generic functions are not supported");
    }

    let mut receiver = false;
    let mut args = vec![];
    let mut types = vec![];
    for input in &func.sig.inputs {
        let typed = match input {
            syn::FnArg::Receiver(recv) => {
                if recv.colon_token.is_none() {
                    bail!(recv, "the receiver must be written as `self: &Arc<Self>`");
                }
                receiver = true;
                continue;
            }
            syn::FnArg::Typed(typed) => typed,
        };

        let name = match typed.pat.as_ref() {
            syn::Pat::Ident(syn::PatIdent {
                by_ref: None,
                mutability: None,
                ident,
                subpat: None,
                ..
            }) => ident.clone(),
            pat => bail!(pat, "only simple identifiers are supported"),
        };

        args.push(name);
        types.push(typed.ty.as_ref().clone());
    }

    // The function body moves into a hidden sibling that the wrapper calls on
    // a cache miss.
    let ident = func.sig.ident.clone();
    let inner = format_ident!("__memograph_{}", ident);
    let mut hidden = func.clone();
    hidden.sig.ident = inner.clone();
    hidden.vis = syn::Visibility::Inherited;
    hidden.attrs = vec![syn::parse_quote! { #[doc(hidden)] }];

    let (name, target, compute) = if receiver {
        (
            quote! {
                ::std::format!(
                    "{}::{}",
                    ::std::any::type_name::<Self>(),
                    ::std::stringify!(#ident),
                )
            },
            quote! { ::memograph::internal::Target::of(self) },
            quote! { self.#inner(#(#args),*) },
        )
    } else {
        (
            quote! {
                ::std::concat!(::std::module_path!(), "::", ::std::stringify!(#ident))
            },
            quote! { ::memograph::internal::Target::none() },
            quote! { #inner(#(#args),*) },
        )
    };

    let options = expand_options(&options);
    let mut wrapper = func;
    wrapper.block = syn::parse_quote! { {
        static METHOD: ::memograph::internal::MethodCell =
            ::memograph::internal::MethodCell::new();

        let __method = METHOD.get_or_register(|| {
            ::memograph::internal::Method::register(
                #name,
                &[#(::memograph::internal::ArgType::of::<#types>()),*],
                #options,
            )
        });

        let __key = ::memograph::internal::CallKey::new(
            #target,
            ::std::sync::Arc::clone(__method),
            ::std::vec![#(
                ::memograph::internal::arg(::std::clone::Clone::clone(&#args))
            ),*],
        );

        ::memograph::internal::call(__key, move || #compute).await
    } };

    Ok(quote! {
        #hidden
        #wrapper
    })
}

/// Build the method's options from the attribute.
fn expand_options(options: &Options) -> proc_macro2::TokenStream {
    let mut expr = quote! { ::memograph::internal::ComputedOptions::DEFAULT };
    let millis = |ms: &syn::LitInt| quote! { ::std::time::Duration::from_millis(#ms) };

    if let Some(ms) = &options.keep_alive {
        let duration = millis(ms);
        expr = quote! { #expr.with_keep_alive(#duration) };
    }

    if let Some(ms) = &options.invalidation_delay {
        let duration = millis(ms);
        expr = quote! { #expr.with_invalidation_delay(#duration) };
    }

    if let Some(ms) = &options.auto_invalidate {
        let duration = millis(ms);
        expr = quote! { #expr.with_auto_invalidation(#duration) };
    }

    if let Some(ms) = &options.transient_error {
        let duration = millis(ms);
        expr = quote! { #expr.with_transient_error_invalidation(#duration) };
    }

    expr
}
