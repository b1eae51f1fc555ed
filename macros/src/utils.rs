use syn::parse::{Parse, ParseStream};
use syn::token::Token;

use super::*;

mod kw {
    syn::custom_keyword!(keep_alive_ms);
    syn::custom_keyword!(invalidation_delay_ms);
    syn::custom_keyword!(auto_invalidate_ms);
    syn::custom_keyword!(transient_error_ms);
}

/// The options of a `#[computed]` attribute.
#[derive(Default)]
pub struct Options {
    pub keep_alive: Option<syn::LitInt>,
    pub invalidation_delay: Option<syn::LitInt>,
    pub auto_invalidate: Option<syn::LitInt>,
    pub transient_error: Option<syn::LitInt>,
}

impl Parse for Options {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut options = Options::default();
        while !input.is_empty() {
            if let Some(v) = parse_key_value::<kw::keep_alive_ms, _>(input)? {
                options.keep_alive = Some(v);
            } else if let Some(v) = parse_key_value::<kw::invalidation_delay_ms, _>(input)? {
                options.invalidation_delay = Some(v);
            } else if let Some(v) = parse_key_value::<kw::auto_invalidate_ms, _>(input)? {
                options.auto_invalidate = Some(v);
            } else if let Some(v) = parse_key_value::<kw::transient_error_ms, _>(input)? {
                options.transient_error = Some(v);
            } else {
                return Err(input.error("memograph: unknown option"));
            }
        }
        Ok(options)
    }
}

/// Parse a metadata key-value pair, separated by `=`.
pub fn parse_key_value<K: Token + Default + Parse, V: Parse>(
    input: ParseStream,
) -> Result<Option<V>> {
    if !input.peek(|_| K::default()) {
        return Ok(None);
    }

    let _: K = input.parse()?;
    let _: syn::Token![=] = input.parse()?;
    let value: V = input.parse::<V>()?;
    eat_comma(input);
    Ok(Some(value))
}

/// Parse a comma if there is one.
pub fn eat_comma(input: ParseStream) {
    if input.peek(syn::Token![,]) {
        let _: Result<syn::Token![,]> = input.parse();
    }
}
