//! Writes `$OUT_DIR/version.txt`, consumed by `main.rs` via `include_str!`.
//!
//! Prefers `git describe` so a flashed image can be traced back to the
//! commit it was built from; falls back to the crate version when not
//! building inside a git checkout (e.g. a vendored source tarball).

use std::env;
use std::path::Path;
use std::process::Command;

fn main() {
	let out_dir = env::var("OUT_DIR").unwrap();
	let dest = Path::new(&out_dir).join("version.txt");

	let version = Command::new("git")
		.args(["describe", "--always", "--dirty=-modified"])
		.output()
		.ok()
		.filter(|output| output.status.success())
		.and_then(|output| String::from_utf8(output.stdout).ok())
		.map(|s| s.trim().to_string())
		.unwrap_or_else(|| env::var("CARGO_PKG_VERSION").unwrap());

	std::fs::write(&dest, version).unwrap();
	println!("cargo:rerun-if-changed=../.git/HEAD");
}
