//! Procedural macros for relaybus - event derivation and handler discovery

use proc_macro::TokenStream;
use syn::{parse_macro_input, DeriveInput};

mod event;
mod handlers;

/// Derive macro for events
///
/// The struct carries its header in a `#[serde(flatten)]` field, either an
/// `EventHeader` (named `header` or marked `#[event(header)]`) or a base event
/// marked `#[event(extends)]`. Handlers of the base type then also receive
/// this event.
///
/// ```rust,ignore
/// #[derive(Event, Serialize, Deserialize)]
/// #[event(tag = "OrderPlaced", response = u64)]
/// struct OrderPlaced {
///     #[serde(flatten)]
///     header: EventHeader,
///     order: u64,
/// }
///
/// #[derive(Event, Serialize, Deserialize)]
/// #[event(tag = "RushOrderPlaced", response = u64)]
/// struct RushOrderPlaced {
///     #[serde(flatten)]
///     #[event(extends)]
///     base: OrderPlaced,
///     deadline: u64,
/// }
/// ```
#[proc_macro_derive(Event, attributes(event))]
pub fn event(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    event::derive_event_impl(input)
}

/// Scan an impl block for `#[handler]` methods and implement `EventHandlers`
///
/// Handler methods take `&self` and one `&E` where `E: Event`, and return
/// `()`, `Reply<E::Response>`, an `Option` of those, or a `Result` of those.
#[proc_macro_attribute]
pub fn event_handlers(args: TokenStream, input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as syn::ItemImpl);
    handlers::event_handlers_impl(args, input)
}

/// Marks a handler method: `#[handler(priority = 10, auto_register = false)]`
#[proc_macro_attribute]
pub fn handler(_args: TokenStream, input: TokenStream) -> TokenStream {
    // Placeholder - actual processing happens in #[event_handlers]
    input
}
