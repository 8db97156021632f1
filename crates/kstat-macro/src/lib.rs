// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::format_ident;
use quote::quote;
use syn::Data;
use syn::DeriveInput;
use syn::Fields;
use syn::Ident;
use syn::parse_macro_input;
use syn::spanned::Spanned;

/// Derive a [`klips::ddi::kstat::KStatProvider`] for a struct whose
/// named fields are all [`klips::ddi::kstat::KStatU64`] counters.
///
/// ```Rust
/// #[derive(KStatProvider)]
/// struct SaStats {
///     inserts: KStatU64,
///     removes: KStatU64,
/// }
/// ```
///
/// Along with the trait impl this generates `SaStatsSnap`, a plain
/// struct of `u64` values used to hand out point-in-time copies of
/// the counters.
#[proc_macro_derive(KStatProvider)]
pub fn derive_kstat_provider(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand(input) {
        Ok(ts) => ts.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

fn expand(input: DeriveInput) -> syn::Result<TokenStream2> {
    let DeriveInput { ident, data, .. } = input;

    let named = match data {
        Data::Struct(s) => match s.fields {
            Fields::Named(named) => named.named,
            other => {
                return Err(syn::Error::new(
                    other.span(),
                    "a KStatProvider must have named fields",
                ));
            }
        },

        _ => {
            return Err(syn::Error::new(
                ident.span(),
                "only a struct may be a KStatProvider",
            ));
        }
    };

    let fields: Vec<Ident> =
        named.iter().filter_map(|f| f.ident.clone()).collect();
    let snap = format_ident!("{}Snap", ident);

    Ok(quote! {
        #[derive(Clone, Debug, Default, ::serde::Serialize)]
        pub struct #snap {
            #( pub #fields: u64, )*
        }

        impl ::klips::ddi::kstat::KStatProvider for #ident {
            const FIELD_NAMES: &'static [&'static str] =
                &[ #( stringify!(#fields), )* ];
            type Snap = #snap;

            fn init(
                &mut self,
            ) -> core::result::Result<(), ::klips::ddi::kstat::Error> {
                #( self.#fields.init(stringify!(#fields))?; )*
                Ok(())
            }

            fn new() -> Self {
                use ::klips::ddi::kstat::KStatU64;

                Self {
                    #( #fields: KStatU64::new(), )*
                }
            }

            fn snapshot(&self) -> Self::Snap {
                #snap {
                    #( #fields: self.#fields.val(), )*
                }
            }

            fn values(&self) -> ::alloc::vec::Vec<u64> {
                ::alloc::vec![ #( self.#fields.val(), )* ]
            }
        }
    })
}
