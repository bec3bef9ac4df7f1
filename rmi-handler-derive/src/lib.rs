//! Derive macros registering remote handlers.
//!
//! `#[derive(RemoteFunction)]` and `#[derive(RemoteMethod)]` give a handler
//! type its stable wire name and register it in the dispatch slice collected
//! by the [`linkme`](https://docs.rs/linkme) crate, so that every binary that
//! links the handler can dispatch calls to it.
//!
//! # Implementation details
//!
//! The wire name is `module_path!()::TypeName`. It is hashed into a 64-bit
//! dispatch identifier once, on first use, and cached in a static owned by
//! the handler. A `HandlerEntry` holding the name and a monomorphized dispatch
//! function pointer is placed in the distributed slice. Both ends of a call
//! only need to agree on the name, never on binary layout.
//!
//! Handlers must be non-generic types. Inside the `rmi` crate itself, add
//! `#[rmi(internal)]` so generated paths resolve through `crate`.
extern crate proc_macro;

use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::quote;
use syn::{parse_macro_input, Attribute, DeriveInput, Error, Ident, Result};

/// Check if the `internal` attribute is present on the derive macro.
///
/// Quoted paths need to be slightly modified if the macro is being called
/// from the `rmi` crate itself.
fn get_is_internal(attrs: &mut Vec<Attribute>) -> Result<bool> {
    let mut is_internal = None;
    let mut errors: Option<Error> = None;

    attrs.retain(|attr| {
        if !attr.path().is_ident("rmi") {
            return true;
        }
        if let Err(err) = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("internal") {
                if is_internal.is_some() {
                    return Err(meta.error("duplicate rmi crate attribute"));
                }

                is_internal = Some(true);
                Ok(())
            } else {
                Err(meta.error("unsupported rmi attribute"))
            }
        }) {
            match &mut errors {
                None => errors = Some(err),
                Some(errors) => errors.combine(err),
            }
        }
        false
    });

    match errors {
        None => Ok(is_internal.unwrap_or(false)),
        Some(errors) => Err(errors),
    }
}

#[derive(Clone, Copy)]
enum HandlerKind {
    Function,
    Method,
}

fn expand(mut input: DeriveInput, kind: HandlerKind) -> Result<TokenStream2> {
    let is_internal = get_is_internal(&mut input.attrs)?;

    if !input.generics.params.is_empty() {
        return Err(Error::new_spanned(
            &input.generics,
            "remote handlers must not be generic",
        ));
    }

    // The path to the `rmi` crate.
    let rmi_path = if is_internal {
        quote! { crate }
    } else {
        quote! { ::rmi }
    };

    // Consumers of the derive macro should not need `linkme` as a direct
    // dependency, so point the attribute at the copy re-exported by `rmi`.
    let linkme_path_override = if is_internal {
        quote! {}
    } else {
        quote! {
            #[linkme(crate=#rmi_path::__private::linkme)]
        }
    };

    let name = &input.ident;
    let entry_name = Ident::new(
        &format!("__RMI_HANDLER_{}", name.to_string().to_uppercase()),
        Span::call_site(),
    );
    let constructor = match kind {
        HandlerKind::Function => quote! { function },
        HandlerKind::Method => quote! { method },
    };

    Ok(quote! {
        impl #rmi_path::handler::RemoteHandler for #name {
            const NAME: &'static str = concat!(module_path!(), "::", stringify!(#name));

            fn id() -> #rmi_path::dispatch::HandlerId {
                static ID: ::std::sync::OnceLock<#rmi_path::dispatch::HandlerId> = ::std::sync::OnceLock::new();
                *ID.get_or_init(|| {
                    #rmi_path::dispatch::HandlerId::of(<Self as #rmi_path::handler::RemoteHandler>::NAME)
                })
            }
        }

        #[#rmi_path::__private::linkme::distributed_slice(#rmi_path::__private::HANDLERS)]
        #linkme_path_override
        #[allow(non_upper_case_globals)]
        static #entry_name: #rmi_path::dispatch::HandlerEntry =
            #rmi_path::dispatch::HandlerEntry::#constructor::<#name>();
    })
}

/// Registers a [`Function`] handler. See the [module level
/// documentation](crate) for more information.
///
/// [`Function`]: https://docs.rs/rmi-core/latest/rmi/handler/trait.Function.html
#[proc_macro_derive(RemoteFunction, attributes(rmi))]
pub fn remote_function_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(input, HandlerKind::Function)
        .unwrap_or_else(Error::into_compile_error)
        .into()
}

/// Registers a [`Method`] handler. See the [module level
/// documentation](crate) for more information.
///
/// [`Method`]: https://docs.rs/rmi-core/latest/rmi/handler/trait.Method.html
#[proc_macro_derive(RemoteMethod, attributes(rmi))]
pub fn remote_method_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(input, HandlerKind::Method)
        .unwrap_or_else(Error::into_compile_error)
        .into()
}
