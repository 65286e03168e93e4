use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use crate::{
    error::{RtError, RtResult},
    DEFAULT_ALPHA, DEFAULT_CHAIN_LENGTH, MAX_PREIMAGE_LENGTH, MAX_SPACE_BITS, TABLE_MIX,
};

/// The parameters a rainbow table is generated and queried with.
/// Persisted next to each table file; all tables of a set must agree on the
/// alphabet and the space size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RainbowTableParams {
    /// The alphabet the preimage strings are built over, in significance
    /// order. Never re-ordered by the engine.
    pub alphabet: Vec<u8>,
    /// The size of the preimage space: the number of strings of length
    /// 0..=max_len over the alphabet.
    pub num_strings: u64,
    /// The number of reduce→hash steps per chain (t).
    pub chain_len: u64,
    /// Distinguishes sibling tables; diversifies the reduction family.
    pub table_index: u64,
    /// The number of start values of this table (m), before deduplication.
    pub num_start_values: u64,
}

impl RainbowTableParams {
    /// The additive shift `TABLE_MIX · table_index mod N` applied by every
    /// reduction of this table.
    pub fn table_shift(&self) -> u64 {
        (TABLE_MIX as u128 * self.table_index as u128 % self.num_strings as u128) as u64
    }

    /// The start indices covered by this table: `[τ·m, τ·m + m)`.
    pub fn start_range(&self) -> std::ops::Range<u64> {
        let lo = self.table_index * self.num_start_values;
        lo..lo + self.num_start_values
    }

    pub(crate) fn validate(&self) -> RtResult<()> {
        let fail = |reason: String| Err(RtError::Config(reason));

        if self.alphabet.is_empty() {
            return fail("the alphabet must contain at least one byte".into());
        }
        let mut seen = [false; 256];
        for &b in &self.alphabet {
            if std::mem::replace(&mut seen[b as usize], true) {
                return fail(format!("the alphabet contains byte {b:#04x} twice"));
            }
        }
        if self.chain_len == 0 {
            return fail("the chain length must be positive".into());
        }
        if self.num_strings >= 1 << MAX_SPACE_BITS {
            return fail(format!(
                "spaces of 2^{MAX_SPACE_BITS} strings or more are not supported"
            ));
        }
        if self.num_start_values == 0 {
            return fail("the number of start values must be positive".into());
        }
        let end = self
            .table_index
            .checked_mul(self.num_start_values)
            .and_then(|lo| lo.checked_add(self.num_start_values));
        match end {
            Some(end) if end <= self.num_strings => Ok(()),
            _ => fail(format!(
                "table index {} places start values beyond the space of {} strings",
                self.table_index, self.num_strings
            )),
        }
    }

    /// The expected number of distinct chains still alive at the given
    /// column, from the usual maximal-table recurrence
    /// `m_{i+1} = N·(1 − e^{−m_i/N})`.
    pub fn expected_unique_chains(&self, column: u64) -> f64 {
        let n = self.num_strings as f64;
        let mut mi = self.num_start_values as f64;
        for _ in 0..column {
            mi = n * (1. - (-mi / n).exp());
        }
        mi
    }

    /// The expected fraction of the preimage space covered by this table.
    pub fn expected_coverage(&self) -> f64 {
        let n = self.num_strings as f64;
        let mut mi = self.num_start_values as f64;
        let mut miss = 1.0f64;
        for _ in 0..self.chain_len {
            miss *= 1. - mi / n;
            mi = n * (1. - (-mi / n).exp());
        }
        1. - miss
    }

    /// The path of the parameter file accompanying a table file.
    pub fn sidecar_path(table_path: &Path) -> PathBuf {
        let mut os = table_path.as_os_str().to_os_string();
        os.push(".params");
        PathBuf::from(os)
    }

    /// Writes the parameter file:
    /// `|A| ' ' A ' ' num_strings ' ' chain_len ' ' table_index ' ' num_start_values`.
    /// The alphabet is written as raw bytes.
    pub fn save_to(&self, path: &Path) -> RtResult<()> {
        let mut buf = Vec::with_capacity(self.alphabet.len() + 64);
        write!(buf, "{} ", self.alphabet.len()).unwrap();
        buf.extend_from_slice(&self.alphabet);
        write!(
            buf,
            " {} {} {} {}",
            self.num_strings, self.chain_len, self.table_index, self.num_start_values
        )
        .unwrap();

        fs::write(path, buf).map_err(|e| RtError::io("write", path, e))
    }

    /// Reads and validates a parameter file.
    pub fn read_from(path: &Path) -> RtResult<Self> {
        let data = fs::read(path).map_err(|e| RtError::io("read", path, e))?;
        let malformed = |reason: String| RtError::Params {
            path: path.to_path_buf(),
            reason,
        };

        let sep = data
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| malformed("missing alphabet length".into()))?;
        let alphabet_len: usize = std::str::from_utf8(&data[..sep])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| malformed("unparseable alphabet length".into()))?;

        // the alphabet is raw bytes, followed by a space separator
        let alphabet_start = sep + 1;
        let alphabet_end = alphabet_start + alphabet_len;
        if alphabet_end >= data.len() || data[alphabet_end] != b' ' {
            return Err(malformed(format!(
                "declared alphabet length {alphabet_len} disagrees with the file contents"
            )));
        }
        let alphabet = data[alphabet_start..alphabet_end].to_vec();

        let rest = std::str::from_utf8(&data[alphabet_end + 1..])
            .map_err(|_| malformed("numeric fields are not valid UTF-8".into()))?;
        let mut fields = rest.split_whitespace();
        let mut next_field = |name: &str| -> RtResult<u64> {
            fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| malformed(format!("missing or unparseable field `{name}`")))
        };

        let params = RainbowTableParams {
            alphabet,
            num_strings: next_field("num_strings")?,
            chain_len: next_field("chain_len")?,
            table_index: next_field("table_index")?,
            num_start_values: next_field("num_start_values")?,
        };
        params.validate().map_err(|e| malformed(e.to_string()))?;

        Ok(params)
    }
}

/// A builder for rainbow table parameters.
#[derive(Clone, Debug)]
pub struct RainbowTableParamsBuilder {
    alphabet: Vec<u8>,
    max_len: u64,
    chain_len: u64,
    table_index: u64,
    alpha: f64,
    start_values: Option<u64>,
}

impl Default for RainbowTableParamsBuilder {
    fn default() -> Self {
        Self {
            alphabet: Vec::new(),
            max_len: 0,
            chain_len: DEFAULT_CHAIN_LENGTH,
            table_index: 0,
            alpha: DEFAULT_ALPHA,
            start_values: None,
        }
    }
}

impl RainbowTableParamsBuilder {
    pub fn new(alphabet: &[u8], max_len: u64) -> Self {
        Self {
            alphabet: alphabet.to_vec(),
            max_len,
            ..Self::default()
        }
    }

    /// Sets the chain length. Longer chains trade table size for lookup
    /// time.
    pub fn chain_len(mut self, chain_len: u64) -> Self {
        self.chain_len = chain_len;
        self
    }

    /// Sets the table index distinguishing sibling tables.
    pub fn table_index(mut self, table_index: u64) -> Self {
        self.table_index = table_index;
        self
    }

    /// Sets the fraction of the space used as start values, in (0, 1].
    pub fn alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    /// Overrides the number of start values directly. Prefer `alpha` unless
    /// a specific chain count is needed.
    pub fn start_values(mut self, start_values: Option<u64>) -> Self {
        self.start_values = start_values;
        self
    }

    pub fn build(self) -> RtResult<RainbowTableParams> {
        if self.max_len == 0 || self.max_len > MAX_PREIMAGE_LENGTH {
            return Err(RtError::Config(format!(
                "the maximum string length must be in 1..={MAX_PREIMAGE_LENGTH}"
            )));
        }
        if !(self.alpha > 0. && self.alpha <= 1.) {
            return Err(RtError::Config(
                "alpha must be a number in the range (0, 1]".into(),
            ));
        }

        // count the strings of length 0..=max_len
        let base = self.alphabet.len() as u128;
        let mut num_strings: u128 = 0;
        let mut cur: u128 = 1;
        for _ in 0..=self.max_len {
            num_strings = num_strings.saturating_add(cur);
            cur = cur.saturating_mul(base);
        }

        if num_strings >= 1 << MAX_SPACE_BITS {
            return Err(RtError::Space {
                requested: 128 - (num_strings - 1).leading_zeros(),
                max: MAX_SPACE_BITS,
            });
        }
        let num_strings = num_strings as u64;

        let num_start_values = match self.start_values {
            Some(m) => m,
            None => ((self.alpha * num_strings as f64) as u64).clamp(1, num_strings),
        };

        let params = RainbowTableParams {
            alphabet: self.alphabet,
            num_strings,
            chain_len: self.chain_len,
            table_index: self.table_index,
            num_start_values,
        };
        params.validate()?;

        Ok(params)
    }
}

#[cfg(test)]
pub(crate) fn build_test_params() -> RainbowTableParams {
    RainbowTableParamsBuilder::new(b"abc", 2)
        .chain_len(5)
        .alpha(1.)
        .build()
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_size() {
        let params = build_test_params();
        // 1 + 3 + 9
        assert_eq!(13, params.num_strings);
        assert_eq!(13, params.num_start_values);
        assert_eq!(0..13, params.start_range());
    }

    #[test]
    fn test_alpha_start_values() {
        let params = RainbowTableParamsBuilder::new(b"0123456789", 4)
            .alpha(0.5)
            .build()
            .unwrap();
        assert_eq!(11111, params.num_strings);
        assert_eq!(5555, params.num_start_values);
    }

    #[test]
    fn test_rejects_bad_configurations() {
        assert!(matches!(
            RainbowTableParamsBuilder::new(b"", 2).build(),
            Err(RtError::Config(_))
        ));
        assert!(matches!(
            RainbowTableParamsBuilder::new(b"aa", 2).build(),
            Err(RtError::Config(_))
        ));
        assert!(matches!(
            RainbowTableParamsBuilder::new(b"ab", 2).alpha(1.5).build(),
            Err(RtError::Config(_))
        ));
        assert!(matches!(
            RainbowTableParamsBuilder::new(b"ab", 2).chain_len(0).build(),
            Err(RtError::Config(_))
        ));
        // 64 symbols and length 10 overflow the 2^56 bound
        assert!(matches!(
            RainbowTableParamsBuilder::new(
                b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz-_",
                10
            )
            .build(),
            Err(RtError::Space { .. })
        ));
    }

    #[test]
    fn test_rejects_out_of_range_table_index() {
        // index 1 with m = N leaves no room for the start values
        let err = RainbowTableParamsBuilder::new(b"abc", 2)
            .alpha(1.)
            .table_index(1)
            .build();
        assert!(matches!(err, Err(RtError::Config(_))));
    }

    #[test]
    fn test_table_shift_diverges_between_siblings() {
        let t0 = RainbowTableParamsBuilder::new(b"0123456789", 4)
            .alpha(0.25)
            .table_index(0)
            .build()
            .unwrap();
        let t1 = RainbowTableParamsBuilder::new(b"0123456789", 4)
            .alpha(0.25)
            .table_index(1)
            .build()
            .unwrap();
        assert_eq!(0, t0.table_shift());
        assert_ne!(t0.table_shift(), t1.table_shift());
        assert!(t1.table_shift() < t1.num_strings);
    }

    #[test]
    fn test_coverage_model() {
        let params = RainbowTableParamsBuilder::new(b"0123456789", 4)
            .chain_len(100)
            .alpha(0.5)
            .build()
            .unwrap();

        // chains merge over the columns, coverage stays a proper fraction
        assert_eq!(
            params.num_start_values as f64,
            params.expected_unique_chains(0)
        );
        assert!(params.expected_unique_chains(100) < params.num_start_values as f64);

        let coverage = params.expected_coverage();
        assert!(coverage > 0. && coverage < 1.);
    }

    #[test]
    fn test_params_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.params");

        let params = RainbowTableParamsBuilder::new(b"0123456789", 3)
            .chain_len(100)
            .table_index(2)
            .alpha(0.1)
            .build()
            .unwrap();
        params.save_to(&path).unwrap();

        assert_eq!(params, RainbowTableParams::read_from(&path).unwrap());
    }

    #[test]
    fn test_params_file_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.params");

        build_test_params().save_to(&path).unwrap();
        assert_eq!(b"3 abc 13 5 0 13".as_slice(), fs::read(&path).unwrap());
    }

    #[test]
    fn test_malformed_params_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.params");

        for contents in [
            "",
            "3",
            "x abc 13 5 0 13",
            "4 abc 13 5 0 13",
            "3 abc 13 5 0",
            "3 abc 13 5 0 nope",
            // start values out of range for the declared space
            "3 abc 13 5 1 13",
        ] {
            fs::write(&path, contents).unwrap();
            assert!(
                RainbowTableParams::read_from(&path).is_err(),
                "accepted {contents:?}"
            );
        }
    }
}
