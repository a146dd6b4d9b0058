// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 weft developers

extern crate proc_macro;

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields};

/// `#[derive(Codec)]` macro: generates the wire-format impl for a value type.
///
/// Each field must itself implement `weft::Codec`. The generated impl packs
/// fields in declaration order, unpacks them in the same order, concatenates
/// their iovec spans, and duplicates field-by-field (so a struct is copyable
/// exactly when all of its fields are).
///
/// Supports named-field structs only; enums and tuple structs need a manual
/// impl.
///
/// Example:
/// ```ignore
/// use weft_codegen::Codec;
///
/// #[derive(Codec)]
/// struct TileMeta {
///     row: u32,
///     col: u32,
///     norm: f64,
///     label: String,    // Variable-length string
///     bytes: Vec<u8>,   // Variable-length byte array
/// }
/// ```
#[proc_macro_derive(Codec, attributes(weft))]
pub fn derive_codec(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    let name = &input.ident;

    // Parse struct fields
    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(f) => &f.named,
            _ => {
                return syn::Error::new_spanned(&input, "Only named fields are supported")
                    .to_compile_error()
                    .into()
            }
        },
        _ => {
            return syn::Error::new_spanned(&input, "Only structs are supported")
                .to_compile_error()
                .into()
        }
    };

    let mut field_names = Vec::new();
    for field in fields {
        let Some(field_name) = field.ident.as_ref() else {
            return syn::Error::new_spanned(field, "Field must have a name")
                .to_compile_error()
                .into();
        };
        field_names.push(field_name.clone());
    }

    let size_terms: Vec<_> = field_names
        .iter()
        .map(|f| quote! { ::weft::core::ser::Codec::payload_size(&self.#f) })
        .collect();

    let pack_stmts: Vec<_> = field_names
        .iter()
        .map(|f| quote! { ::weft::core::ser::Codec::pack(&self.#f, cur)?; })
        .collect();

    let unpack_fields: Vec<_> = field_names
        .iter()
        .map(|f| quote! { #f: ::weft::core::ser::Codec::unpack(cur)?, })
        .collect();

    let iovec_stmts: Vec<_> = field_names
        .iter()
        .map(|f| quote! { spans.extend(::weft::core::ser::Codec::iovecs(&mut self.#f)); })
        .collect();

    let dup_fields: Vec<_> = field_names
        .iter()
        .map(|f| quote! { #f: ::weft::core::ser::Codec::try_duplicate(&self.#f)?, })
        .collect();

    let expanded = quote! {
        impl ::weft::core::ser::Codec for #name {
            fn payload_size(&self) -> usize {
                0 #( + #size_terms )*
            }

            fn pack(
                &self,
                cur: &mut ::weft::core::ser::CursorMut<'_>,
            ) -> ::weft::core::ser::SerResult<()> {
                #( #pack_stmts )*
                Ok(())
            }

            fn unpack(
                cur: &mut ::weft::core::ser::Cursor<'_>,
            ) -> ::weft::core::ser::SerResult<Self> {
                Ok(Self {
                    #( #unpack_fields )*
                })
            }

            fn iovecs(&mut self) -> ::std::vec::Vec<::weft::core::ser::IoSpan> {
                let mut spans = ::std::vec::Vec::new();
                #( #iovec_stmts )*
                spans
            }

            fn try_duplicate(&self) -> ::std::option::Option<Self> {
                ::std::option::Option::Some(Self {
                    #( #dup_fields )*
                })
            }
        }
    };

    TokenStream::from(expanded)
}
