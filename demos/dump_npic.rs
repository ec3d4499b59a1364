use std::env::args;

use anyhow::{bail, Result};

use npic_pickle as np;

fn main() -> Result<()> {
    env_logger::init();

    let fname = if let Some(fname) = args().nth(1) {
        println!("* Dumping: {fname}\n");
        fname
    } else {
        bail!("Specify NPIC filename!");
    };
    let buf = std::fs::read(&fname)?;
    println!("* Detection score: {}", np::npic::detect(&fname, Some(&buf)));

    let file = np::NpicFile::from_bytes(&buf)?;
    for channel in &file.channels {
        println!("{channel}");
    }
    println!("\n* Metadata:");
    for (k, v) in &file.metadata.entries {
        println!("  {k} = {v}");
    }
    Ok(())
}
