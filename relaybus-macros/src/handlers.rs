//! `#[event_handlers]` implementation - the handler scanner

use proc_macro::TokenStream;
use quote::quote;
use syn::{Expr, FnArg, ImplItem, ImplItemFn, ItemImpl, LitBool, Type};

struct HandlerAttr {
    priority: Expr,
    auto_register: bool,
}

/// Expand an impl block, listing every `#[handler]` method in an
/// `EventHandlers` implementation
pub fn event_handlers_impl(args: TokenStream, mut input: ItemImpl) -> TokenStream {
    if !args.is_empty() {
        let args = proc_macro2::TokenStream::from(args);
        return syn::Error::new_spanned(args, "#[event_handlers] takes no arguments")
            .to_compile_error()
            .into();
    }

    let mut entries = Vec::new();
    let mut errors = Vec::new();

    for item in &mut input.items {
        let ImplItem::Fn(method) = item else {
            continue;
        };
        match take_handler_attr(method) {
            Ok(Some(attr)) => entries.push(handler_entry(method, attr)),
            Ok(None) => {}
            Err(err) => errors.push(err.to_compile_error()),
        }
    }

    let self_ty = &input.self_ty;
    let (impl_generics, _, where_clause) = input.generics.split_for_impl();

    let expanded = quote! {
        #input

        impl #impl_generics ::relaybus::EventHandlers for #self_ty #where_clause {
            fn handler_methods() -> ::std::vec::Vec<::relaybus::HandlerMethod<Self>> {
                ::std::vec![#(#entries),*]
            }
        }

        #(#errors)*
    };

    TokenStream::from(expanded)
}

/// Remove the `#[handler]` attributes of a method and parse the last one
fn take_handler_attr(method: &mut ImplItemFn) -> syn::Result<Option<HandlerAttr>> {
    let mut parsed = None;
    let mut result = Ok(());

    method.attrs.retain(|attr| {
        if !attr.path().is_ident("handler") {
            return true;
        }
        let mut handler = HandlerAttr {
            priority: syn::parse_quote!(0),
            auto_register: true,
        };
        if !matches!(attr.meta, syn::Meta::Path(_)) {
            let parse = attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("priority") {
                    handler.priority = meta.value()?.parse()?;
                    Ok(())
                } else if meta.path.is_ident("auto_register") {
                    let value: LitBool = meta.value()?.parse()?;
                    handler.auto_register = value.value;
                    Ok(())
                } else {
                    Err(meta.error("expected `priority = <i32>` or `auto_register = <bool>`"))
                }
            });
            if let Err(err) = parse {
                result = Err(err);
            }
        }
        parsed = Some(handler);
        false
    });

    result.map(|()| parsed)
}

/// Build the `HandlerMethod` for one method; signatures that cannot be bound
/// become `HandlerMethod::malformed` so registration rejects them at runtime
fn handler_entry(method: &ImplItemFn, attr: HandlerAttr) -> proc_macro2::TokenStream {
    let ident = &method.sig.ident;
    let name = ident.to_string();
    let HandlerAttr {
        priority,
        auto_register,
    } = attr;

    match event_type(method) {
        Ok(event_ty) => quote! {
            ::relaybus::HandlerMethod::new(
                #name,
                #priority,
                #auto_register,
                |this: &Self, event: &#event_ty| this.#ident(event),
            )
        },
        Err(reason) => quote! {
            ::relaybus::HandlerMethod::malformed(#name, #priority, #auto_register, #reason)
        },
    }
}

/// The `E` of `fn(&self, event: &E)`, or why the signature does not fit
fn event_type(method: &ImplItemFn) -> Result<&Type, String> {
    let sig = &method.sig;
    if sig.asyncness.is_some() {
        return Err("handlers must be synchronous".to_string());
    }
    if !sig.generics.params.is_empty() {
        return Err("handlers must not be generic".to_string());
    }

    let mut inputs = sig.inputs.iter();
    match inputs.next() {
        Some(FnArg::Receiver(receiver))
            if receiver.reference.is_some() && receiver.mutability.is_none() => {}
        _ => return Err("handlers must take `&self`".to_string()),
    }

    let params: Vec<_> = inputs.collect();
    if params.len() != 1 {
        return Err(format!(
            "handlers take exactly one event parameter, found {}",
            params.len()
        ));
    }

    let FnArg::Typed(param) = params[0] else {
        return Err("unexpected receiver".to_string());
    };
    match param.ty.as_ref() {
        Type::Reference(reference) if reference.mutability.is_none() => Ok(reference.elem.as_ref()),
        _ => Err("the event parameter must be a shared reference `&E`".to_string()),
    }
}
