mod from_repr;

use proc_macro::TokenStream;

/// Derives `from_repr(discriminant) -> Option<Self>` for a fieldless enum with
/// explicit discriminants, honoring an explicit `#[repr(..)]` if present.
#[proc_macro_derive(FromRepr)]
pub fn derive_from_repr(input: TokenStream) -> TokenStream {
	from_repr::derive(input).into()
}
