pub mod greedy;

use indexmap::IndexSet;

use crate::error::{CrnnError, Result};

pub use greedy::{collapse_path, decode_greedy};

// Converter maps transcription characters to class indices and back. One of
// the alphabet positions is reserved for the CTC blank.
#[derive(Debug, Clone)]
pub struct Converter {
    alphabet: IndexSet<char>,
    blank: usize,
}

impl Converter {
    pub fn new(alphabet: &str, blank: usize) -> Result<Self> {
        let mut symbols = IndexSet::with_capacity(alphabet.len());
        for ch in alphabet.chars() {
            if !symbols.insert(ch) {
                return Err(CrnnError::InvalidAlphabet(format!(
                    "symbol {ch:?} appears more than once"
                )));
            }
        }

        if symbols.is_empty() {
            return Err(CrnnError::InvalidAlphabet("alphabet is empty".to_string()));
        }
        if blank >= symbols.len() {
            return Err(CrnnError::InvalidAlphabet(format!(
                "blank index {blank} is outside the alphabet of {} symbols",
                symbols.len()
            )));
        }

        Ok(Self {
            alphabet: symbols,
            blank,
        })
    }

    /// Number of output classes of the model, blank included.
    pub fn num_classes(&self) -> usize {
        self.alphabet.len()
    }

    pub fn blank(&self) -> usize {
        self.blank
    }

    pub fn blank_symbol(&self) -> char {
        self.alphabet[self.blank]
    }

    pub fn encode(&self, symbol: char) -> Result<usize> {
        self.alphabet
            .get_index_of(&symbol)
            .ok_or_else(|| CrnnError::UnknownSymbol {
                symbol,
                text: symbol.to_string(),
            })
    }

    pub fn decode(&self, index: usize) -> Result<char> {
        self.alphabet
            .get_index(index)
            .copied()
            .ok_or(CrnnError::IndexOutOfRange {
                index,
                size: self.alphabet.len(),
            })
    }

    /// Encodes a transcription into CTC target indices.
    ///
    /// The blank symbol is rejected here: a target containing it has no
    /// valid alignment.
    pub fn encode_single<S: AsRef<str>>(&self, text: S) -> Result<Vec<i64>> {
        let text = text.as_ref();
        text.chars()
            .map(|symbol| match self.alphabet.get_index_of(&symbol) {
                Some(idx) if idx == self.blank => Err(CrnnError::ReservedSymbol {
                    symbol,
                    text: text.to_string(),
                }),
                Some(idx) => Ok(idx as i64),
                None => Err(CrnnError::UnknownSymbol {
                    symbol,
                    text: text.to_string(),
                }),
            })
            .collect()
    }

    /// Encodes a batch of transcriptions into the flattened form CTC expects,
    /// along with the per-sample target lengths.
    pub fn encode_multi<S: AsRef<str>>(&self, texts: &[S]) -> Result<(Vec<i64>, Vec<i64>)> {
        let mut encoded = Vec::with_capacity(texts.iter().map(|t| t.as_ref().len()).sum());
        let mut lengths = Vec::with_capacity(texts.len());

        for text in texts {
            let target = self.encode_single(text)?;
            lengths.push(target.len() as i64);
            encoded.extend(target);
        }

        Ok((encoded, lengths))
    }

    /// Turns a class path (one index per timestep) into text with the CTC
    /// collapsing rule applied.
    pub fn decode_path(&self, path: &[usize]) -> Result<String> {
        collapse_path(path, self.blank)
            .into_iter()
            .map(|idx| self.decode(idx))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn converter() -> Converter {
        Converter::new("_ab c", 0).unwrap()
    }

    #[test]
    fn test_round_trip_every_symbol() {
        let converter = converter();
        for symbol in "_ab c".chars() {
            let idx = converter.encode(symbol).unwrap();
            assert_eq!(converter.decode(idx).unwrap(), symbol);
        }
        assert_eq!(converter.num_classes(), 5);
        assert_eq!(converter.blank_symbol(), '_');
    }

    #[test]
    fn test_unknown_symbol() {
        let err = converter().encode_single("abz").unwrap_err();
        assert!(matches!(err, CrnnError::UnknownSymbol { symbol: 'z', .. }));
        assert!(err.to_string().contains("'z'"));
    }

    #[test]
    fn test_blank_in_transcription_is_rejected() {
        let err = converter().encode_single("a_b").unwrap_err();
        assert!(matches!(err, CrnnError::ReservedSymbol { symbol: '_', .. }));
    }

    #[test]
    fn test_index_out_of_range() {
        let err = converter().decode(5).unwrap_err();
        assert!(matches!(err, CrnnError::IndexOutOfRange { index: 5, size: 5 }));
    }

    #[test]
    fn test_invalid_alphabets() {
        assert!(Converter::new("abca", 0).is_err());
        assert!(Converter::new("", 0).is_err());
        assert!(Converter::new("ab", 2).is_err());
    }

    #[test]
    fn test_encode_multi_flattens() {
        let (targets, lengths) = converter().encode_multi(&["ab", "", "c b"]).unwrap();
        assert_eq!(targets, vec![1, 2, 4, 3, 2]);
        assert_eq!(lengths, vec![2, 0, 3]);
        assert_eq!(lengths.iter().sum::<i64>() as usize, targets.len());
    }

    #[test]
    fn test_decode_path() {
        let converter = Converter::new("_ab", 0).unwrap();
        // a a _ b b a
        assert_eq!(converter.decode_path(&[1, 1, 0, 2, 2, 1]).unwrap(), "aba");
    }
}
