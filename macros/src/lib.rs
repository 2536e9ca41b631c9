use proc_macro::TokenStream;

use quote::quote;
use syn::spanned::Spanned;
use syn::{parse_macro_input, ItemFn, ReturnType};

/// Runs the function body as the first fiber, then drives the scheduler until every fiber stops.
///
/// A panic in any fiber is resumed on the calling thread.
#[proc_macro_attribute]
pub fn main(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let item = parse_macro_input!(item as ItemFn);

    if let Some(error) = unsupported(&item) {
        return error.to_compile_error().into();
    }

    let attributes = &item.attrs;
    let visibility = &item.vis;
    let signature = &item.sig;
    let body = &item.block;

    let result = quote! {
        #(#attributes)*
        #visibility #signature {
            ::strand::spawn(move || #body);

            if let Err(payload) = ::strand::runtime::run() {
                ::std::panic::resume_unwind(payload);
            }
        }
    };

    result.into()
}

/// Fibers take no arguments and return nothing.
fn unsupported(item: &ItemFn) -> Option<syn::Error> {
    let signature = &item.sig;

    if let Some(asyncness) = signature.asyncness {
        return Some(syn::Error::new(asyncness.span(), "fibers can't be async"));
    }
    if !signature.inputs.is_empty() {
        return Some(syn::Error::new(signature.inputs.span(), "fiber entry takes no arguments"));
    }
    if let ReturnType::Type(_, ty) = &signature.output {
        return Some(syn::Error::new(ty.span(), "fiber entry can't return a value"));
    }

    None
}
