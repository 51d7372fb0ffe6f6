//! Build script for tlsprobe-capture-ebpf
//!
//! On Linux, this embeds the kernel object built from `ebpf/tlsprobe-ebpf`.
//! The object is built separately (nightly + bpf-linker), so a missing object
//! only means the binary needs `--ebpf-object` at runtime.

use std::env;
use std::path::PathBuf;

fn main() {
    // Tell cargo about our custom cfg flags
    println!("cargo::rustc-check-cfg=cfg(embedded_probe_object)");

    println!("cargo:rerun-if-env-changed=TLSPROBE_EBPF_OBJECT");

    // Only embed on Linux
    if env::var("CARGO_CFG_TARGET_OS").unwrap_or_default() != "linux" {
        return;
    }

    if let Err(e) = embed_object() {
        println!(
            "cargo:warning=eBPF object not embedded: {}. \
             Pass --ebpf-object at runtime.",
            e
        );
    }
}

fn embed_object() -> Result<(), String> {
    let out_dir = env::var("OUT_DIR").map_err(|e| format!("OUT_DIR not set: {}", e))?;
    let out_path = PathBuf::from(&out_dir).join("tlsprobe.bpf.o");

    let manifest_dir = env::var("CARGO_MANIFEST_DIR")
        .map_err(|e| format!("CARGO_MANIFEST_DIR not set: {}", e))?;
    let workspace_root = PathBuf::from(&manifest_dir)
        .parent() // crates/
        .and_then(|p| p.parent())
        .map(PathBuf::from)
        .ok_or("Failed to find workspace root")?;

    let mut candidates = Vec::new();
    if let Ok(path) = env::var("TLSPROBE_EBPF_OBJECT") {
        candidates.push(PathBuf::from(path));
    }
    for profile in ["release", "debug"] {
        candidates.push(
            workspace_root
                .join("ebpf/target/bpfel-unknown-none")
                .join(profile)
                .join("tlsprobe"),
        );
    }

    let Some(source) = candidates.iter().find(|path| path.exists()) else {
        return Err(format!("looked in {:?}", candidates));
    };
    println!("cargo:rerun-if-changed={}", source.display());
    std::fs::copy(source, &out_path)
        .map_err(|e| format!("Failed to copy {}: {}", source.display(), e))?;

    println!("cargo:rustc-cfg=embedded_probe_object");
    println!("cargo:rustc-env=TLSPROBE_EBPF_OBJECT_PATH={}", out_path.display());
    println!(
        "cargo:warning=Embedded eBPF object from {} ({} bytes)",
        source.display(),
        std::fs::metadata(&out_path).map(|m| m.len()).unwrap_or(0)
    );
    Ok(())
}
