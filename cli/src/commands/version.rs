//! `a3s-bake version` command.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("a3s-bake version {}", a3s_bake_core::VERSION);
    println!("runtime {}", a3s_bake_runtime::VERSION);
    Ok(())
}
