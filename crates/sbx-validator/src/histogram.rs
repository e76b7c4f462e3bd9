//! Optional mnemonic histogram, reported after summarization.

use std::collections::BTreeMap;

use sbx_x86::Mnemonic;

#[derive(Debug, Default)]
pub(crate) struct OpcodeHistogram {
    counts: BTreeMap<String, u64>,
    total: u64,
}

impl OpcodeHistogram {
    pub(crate) fn record(&mut self, mnemonic: Mnemonic) {
        *self.counts.entry(format!("{mnemonic:?}")).or_default() += 1;
        self.total += 1;
    }

    /// Report lines, most frequent first.
    pub(crate) fn lines(&self) -> Vec<String> {
        if self.total == 0 {
            return Vec::new();
        }
        let mut entries: Vec<(&String, &u64)> = self.counts.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let mut lines = vec![format!("Opcode histogram ({} instructions):", self.total)];
        for (name, count) in entries {
            lines.push(format!("  {name}: {count}"));
        }
        lines
    }
}
