/// Levenshtein distance with unit costs for insertion, deletion and substitution.
pub fn edit_distance<T: PartialEq>(reference: &[T], hypothesis: &[T]) -> usize {
    if reference.is_empty() {
        return hypothesis.len();
    }
    if hypothesis.is_empty() {
        return reference.len();
    }

    let mut previous: Vec<usize> = (0..=hypothesis.len()).collect();
    let mut current = vec![0; hypothesis.len() + 1];

    for (i, r) in reference.iter().enumerate() {
        current[0] = i + 1;
        for (j, h) in hypothesis.iter().enumerate() {
            let substitution = previous[j] + usize::from(r != h);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[hypothesis.len()]
}

// normalized by the reference length, never the hypothesis
fn normalized<T: PartialEq>(reference: &[T], hypothesis: &[T]) -> f64 {
    edit_distance(reference, hypothesis) as f64 / reference.len().max(1) as f64
}

/// Character error rate.
pub fn cer(reference: &str, hypothesis: &str) -> f64 {
    let reference: Vec<char> = reference.chars().collect();
    let hypothesis: Vec<char> = hypothesis.chars().collect();

    normalized(&reference, &hypothesis)
}

/// Word error rate, over whitespace separated tokens.
pub fn wer(reference: &str, hypothesis: &str) -> f64 {
    let reference: Vec<&str> = reference.split_whitespace().collect();
    let hypothesis: Vec<&str> = hypothesis.split_whitespace().collect();

    normalized(&reference, &hypothesis)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance(&b"kitten"[..], &b"sitting"[..]), 3);
        assert_eq!(edit_distance(&b""[..], &b"abc"[..]), 3);
        assert_eq!(edit_distance(&b"abc"[..], &b""[..]), 3);
        assert_eq!(edit_distance(&b"flaw"[..], &b"lawn"[..]), 2);
    }

    #[test]
    fn test_cer() {
        assert_eq!(cer("", ""), 0.0);
        assert_eq!(cer("abc", "abc"), 0.0);
        assert!((cer("abc", "abd") - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(format!("{:.2}", cer("abc", "abd")), "0.33");
        // empty reference divides by one
        assert_eq!(cer("", "ab"), 2.0);
    }

    #[test]
    fn test_cer_is_directional() {
        assert_eq!(cer("ab", "abcd"), 1.0);
        assert_eq!(cer("abcd", "ab"), 0.5);
    }

    #[test]
    fn test_wer() {
        assert_eq!(wer("the cat sat", "the cat sat"), 0.0);
        assert!((wer("the cat sat", "the dog sat") - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(wer("a b", ""), 1.0);
    }

    #[test]
    fn test_wer_ignores_whitespace_runs() {
        assert_eq!(wer("the  cat\tsat ", " the cat   sat"), 0.0);
        assert_eq!(
            wer("the cat sat", "the  dog   sat"),
            wer("the cat sat", "the dog sat")
        );
    }

    #[test]
    fn test_multibyte_characters() {
        assert_eq!(cer("日本語", "日本"), 1.0 / 3.0);
    }
}
