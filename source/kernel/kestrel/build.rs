// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

fn main() {
    println!("cargo:rerun-if-env-changed=KESTREL_LINKER_SCRIPT");
    if let Ok(script) = std::env::var("KESTREL_LINKER_SCRIPT") {
        println!("cargo:rustc-link-arg-bins=-T{script}");
    }
}
