use std::{
    fs,
    io::{self, Write},
};

use anyhow::{Context, Result};

use rtcrack_core::{
    format_hex_digest, lookup_tables, parse_hex_digest, sample_digests, string_from_index, Digest,
    RainbowTableParams,
};

use crate::Lookup;

pub fn lookup(args: Lookup) -> Result<()> {
    let backend = args.device.to_backend()?;

    // sibling tables agree on the alphabet and space, so the first table's
    // parameters describe the query space
    let params =
        RainbowTableParams::read_from(&RainbowTableParams::sidecar_path(&args.tables[0]))?;

    if let Some(samples) = args.samples {
        let drawn = sample_digests(&params, samples as usize, args.seed);
        let queries: Vec<Digest> = drawn.into_iter().map(|(_, h)| h).collect();

        let results = lookup_tables(&args.tables, &queries, &backend)?;
        let found = results.iter().filter(|r| r.is_some()).count();

        println!(
            "coverage: {:.2}% ({found}/{samples})",
            100. * found as f64 / samples as f64
        );
        return Ok(());
    }

    let queries: Vec<Digest> = match &args.file {
        Some(file) => {
            let contents = fs::read_to_string(file)
                .with_context(|| format!("unable to read the hash file {}", file.display()))?;
            contents
                .split_whitespace()
                .map(|word| {
                    parse_hex_digest(word)
                        .with_context(|| format!("invalid hash `{word}` in the input file"))
                })
                .collect::<Result<_>>()?
        }
        // the argument group guarantees one mode is present
        None => vec![parse_hex_digest(args.hash.as_ref().unwrap())
            .context("the given hash is not a valid digest")?],
    };

    let results = lookup_tables(&args.tables, &queries, &backend)?;

    let mut stdout = io::stdout().lock();
    for (h, result) in queries.iter().zip(&results) {
        write!(stdout, "{} ", format_hex_digest(h))?;
        match result {
            Some(x) => stdout.write_all(&string_from_index(*x, &params.alphabet))?,
            None => stdout.write_all(b"-")?,
        }
        stdout.write_all(b"\n")?;
    }

    Ok(())
}
