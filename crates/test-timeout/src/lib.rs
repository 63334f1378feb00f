//! `#[tokio_timeout_test]` runs an async test on a dedicated multi-threaded
//! Tokio runtime and fails it once the deadline passes, even if the test body
//! blocks a runtime thread.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Attribute, ItemFn, LitInt, parse_macro_input};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const WORKER_THREADS: usize = 2;

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = match parse_timeout(attr.into()) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();
    let name = sig.ident.to_string();
    let workers = WORKER_THREADS;

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#timeout_secs);
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            std::thread::Builder::new()
                .name(format!("{}-runtime", #name))
                .spawn(move || {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let runtime = tokio::runtime::Builder::new_multi_thread()
                            .worker_threads(#workers)
                            .enable_all()
                            .build()
                            .expect("failed to build Tokio runtime");
                        runtime.block_on(async move {
                            if tokio::time::timeout(deadline, async move #block).await.is_err() {
                                panic!("{} timed out after {:?}", #name, deadline);
                            }
                        });
                    }));
                    let _ = done_tx.send(outcome);
                })
                .expect("failed to spawn test thread");
            match done_rx.recv_timeout(deadline + std::time::Duration::from_secs(1)) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("{} is stuck past {:?}", #name, deadline)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("{} thread exited without a result", #name)
                }
            }
        }
    })
}

fn parse_timeout(attr: TokenStream2) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse2(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

/// Matches `#[test]` and `#[tokio::test(...)]`, which the macro replaces.
fn is_test_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
