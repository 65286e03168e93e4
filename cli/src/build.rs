use anyhow::{Context, Result};
use tracing::info;

use rtcrack_core::{sample_digests, Engine as _, RainbowTableParamsBuilder};

use crate::Build;

pub fn build(args: Build) -> Result<()> {
    let params = RainbowTableParamsBuilder::new(args.alphabet.as_bytes(), args.max_len)
        .alpha(args.alpha)
        .chain_len(args.chain_len)
        .table_index(args.table_index)
        .build()?;

    info!(
        num_strings = params.num_strings,
        start_values = params.num_start_values,
        chain_len = params.chain_len,
        table_index = params.table_index,
        expected_coverage = %format!("{:.2}%", 100. * params.expected_coverage()),
        "building table"
    );

    let mut engine = args.device.to_backend()?.engine()?;
    let table = engine.build(&params)?;
    table
        .save(&args.outfile)
        .context("unable to store the generated table")?;

    info!(
        table = %args.outfile.display(),
        unique_chains = table.len(),
        "table stored"
    );

    if args.samples > 0 {
        let drawn = sample_digests(&params, args.samples as usize, args.seed);
        let queries: Vec<_> = drawn.into_iter().map(|(_, h)| h).collect();

        let results = engine.lookup(&table, &queries)?;
        let found = results.iter().filter(|r| r.is_some()).count();

        info!(
            measured = %format!("{:.2}%", 100. * found as f64 / queries.len() as f64),
            samples = args.samples,
            "coverage estimate"
        );
    }

    Ok(())
}
