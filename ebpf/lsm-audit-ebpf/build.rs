//! Generates `vmlinux.rs` bindings for the kernel structs the hooks walk.
//!
//! Needs `aya-tool` (from the aya repository) and a kernel with
//! `/sys/kernel/btf/vmlinux`. Set `AYA_TOOL` to use a binary outside PATH.

use std::env;
use std::path::PathBuf;
use std::process::Command;

/// Structs reachable from `bpf_get_current_task_btf()` and the file_open argument
const TYPES: &[&str] = &["task_struct", "mm_struct", "file", "path"];

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=AYA_TOOL");

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
    let aya_tool = env::var_os("AYA_TOOL")
        .map(PathBuf::from)
        .or_else(|| which::which("aya-tool").ok())
        .expect(
            "aya-tool is required to generate vmlinux bindings.\n\
             Install via: cargo install --git https://github.com/aya-rs/aya aya-tool",
        );

    let output = Command::new(&aya_tool)
        .arg("generate")
        .args(TYPES)
        .output()
        .expect("failed to run aya-tool");
    assert!(
        output.status.success(),
        "aya-tool generate failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    std::fs::write(out_dir.join("vmlinux.rs"), &output.stdout).expect("failed to write vmlinux.rs");
}
