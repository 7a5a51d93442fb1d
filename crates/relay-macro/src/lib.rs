//! Internal proc-macros for the cloud relay crate.
//!
//! This crate is intended for inner use only by the `relay` crate.

#![forbid(non_ascii_idents, unsafe_code)]

mod dispatchable;

use proc_macro::TokenStream;

/// Generates a `*Handler` trait and a dispatching `dispatch_with()` method
/// for an inbound-frame `enum`.
///
/// For an `enum` named `Foo`, generates a `FooHandler` trait with one method
/// per variant (`snake_case` name prefixed with `on_`), and an inherent
/// `Foo::dispatch_with(self, handler: &mut impl FooHandler) -> FooHandler::Output`
/// that matches on the variant and calls the corresponding method.
#[proc_macro_attribute]
pub fn dispatchable(_args: TokenStream, input: TokenStream) -> TokenStream {
    dispatchable::derive(input)
        .unwrap_or_else(|e| e.to_compile_error().into())
}
