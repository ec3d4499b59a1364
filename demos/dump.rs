use std::{env::args, fs::File, io::Read};

use anyhow::{bail, Result};

use npic_pickle as np;

fn main() -> Result<()> {
    env_logger::init();

    let mut fp = if let Some(fname) = args().nth(1) {
        println!("* Dumping: {fname}\n");
        File::open(fname)?
    } else {
        bail!("Specify pickle filename!");
    };
    let mut buf = Vec::with_capacity(fp.metadata().map(|md| md.len() as usize).unwrap_or(16384));
    let _ = fp.read_to_end(&mut buf)?;

    let mut stream = np::PickleStream::new(&buf);
    let mut n = 0;
    loop {
        let offset = stream.offset();
        let Some(result) = stream.next() else {
            break;
        };
        match result {
            Ok(pickle) => {
                println!("* Pickle {n} at offset {offset}:");
                print!("{}", pickle.root());
                println!();
                n += 1;
            }
            Err(e) => {
                println!("ERROR: {e} ({:?})", e.kind());
                break;
            }
        }
    }
    Ok(())
}
