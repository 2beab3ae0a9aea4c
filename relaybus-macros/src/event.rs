//! Event derive macro implementation

use proc_macro::TokenStream;
use quote::quote;
use syn::{Attribute, Data, DeriveInput, Fields, Ident, LitStr, Member, Type};

/// How the event reaches its header
enum HeaderSource {
    /// A field holding the `EventHeader` itself
    Own(Member),
    /// A field holding the base event this event extends
    Base(Member),
}

/// Implementation of the Event derive macro
pub fn derive_event_impl(input: DeriveInput) -> TokenStream {
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let (tag, response) = parse_event_attrs(&input.attrs, name)?;
    let source = find_header(input)?;

    let (header_access, view_impl) = match &source {
        HeaderSource::Own(member) => (
            quote! {
                fn header(&self) -> &::relaybus::EventHeader {
                    &self.#member
                }

                fn header_mut(&mut self) -> &mut ::relaybus::EventHeader {
                    &mut self.#member
                }
            },
            quote! {},
        ),
        HeaderSource::Base(member) => (
            quote! {
                fn header(&self) -> &::relaybus::EventHeader {
                    ::relaybus::Event::header(&self.#member)
                }

                fn header_mut(&mut self) -> &mut ::relaybus::EventHeader {
                    ::relaybus::Event::header_mut(&mut self.#member)
                }
            },
            quote! {
                fn view(
                    &self,
                    type_id: ::std::any::TypeId,
                ) -> ::std::option::Option<&dyn ::std::any::Any> {
                    if type_id == ::std::any::TypeId::of::<Self>() {
                        ::std::option::Option::Some(self)
                    } else {
                        ::relaybus::Event::view(&self.#member, type_id)
                    }
                }
            },
        ),
    };

    Ok(quote! {
        impl #impl_generics ::relaybus::Event for #name #ty_generics #where_clause {
            const TYPE_TAG: &'static str = #tag;
            type Response = #response;

            #header_access

            #view_impl
        }
    })
}

/// Parse `#[event(tag = "...", response = Type)]`
fn parse_event_attrs(attrs: &[Attribute], name: &Ident) -> syn::Result<(LitStr, Type)> {
    let mut tag = None;
    let mut response = None;

    for attr in attrs.iter().filter(|attr| attr.path().is_ident("event")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("tag") {
                let value: LitStr = meta.value()?.parse()?;
                if value.value().is_empty() {
                    return Err(meta.error("event tag must not be empty"));
                }
                tag = Some(value);
                Ok(())
            } else if meta.path.is_ident("response") {
                response = Some(meta.value()?.parse::<Type>()?);
                Ok(())
            } else {
                Err(meta.error("expected `tag = \"...\"` or `response = Type`"))
            }
        })?;
    }

    let tag = tag.unwrap_or_else(|| LitStr::new(&name.to_string(), name.span()));
    let response = response.unwrap_or_else(|| syn::parse_quote!(()));
    Ok((tag, response))
}

/// Locate the header: a field marked `#[event(header)]` or `#[event(extends)]`,
/// else a field named `header`
fn find_header(input: &DeriveInput) -> syn::Result<HeaderSource> {
    let fields = match &input.data {
        Data::Struct(data) => &data.fields,
        _ => {
            return Err(syn::Error::new_spanned(
                &input.ident,
                "Event can only be derived for structs",
            ))
        }
    };

    let members: Vec<(Member, &syn::Field)> = match fields {
        Fields::Named(named) => named
            .named
            .iter()
            .filter_map(|field| field.ident.clone().map(|ident| (Member::Named(ident), field)))
            .collect(),
        Fields::Unnamed(unnamed) => unnamed
            .unnamed
            .iter()
            .enumerate()
            .map(|(index, field)| (Member::Unnamed(index.into()), field))
            .collect(),
        Fields::Unit => Vec::new(),
    };

    let mut found = None;
    for (member, field) in &members {
        for attr in field.attrs.iter().filter(|attr| attr.path().is_ident("event")) {
            let mut marked = None;
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("header") {
                    marked = Some(HeaderSource::Own(member.clone()));
                    Ok(())
                } else if meta.path.is_ident("extends") {
                    marked = Some(HeaderSource::Base(member.clone()));
                    Ok(())
                } else {
                    Err(meta.error("expected `header` or `extends`"))
                }
            })?;
            if let Some(source) = marked {
                if found.is_some() {
                    return Err(syn::Error::new_spanned(
                        attr,
                        "only one field may be marked `header` or `extends`",
                    ));
                }
                found = Some(source);
            }
        }
    }

    if let Some(source) = found {
        return Ok(source);
    }

    members
        .iter()
        .find(|(member, _)| matches!(member, Member::Named(ident) if ident == "header"))
        .map(|(member, _)| HeaderSource::Own(member.clone()))
        .ok_or_else(|| {
            syn::Error::new_spanned(
                &input.ident,
                "Event needs a `header: EventHeader` field, or a field marked #[event(header)] or #[event(extends)]",
            )
        })
}
