//! Kernel sources baked into the library at compile time.

/// Returns the source text for a named kernel fragment, if it exists.
pub(crate) fn source(name: &str) -> Option<&'static str> {
    match name {
        "scan.cl" => Some(include_str!("kernels/scan.cl")),
        "reduce.cl" => Some(include_str!("kernels/reduce.cl")),
        "radixsort.cl" => Some(include_str!("kernels/radixsort.cl")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_fragments() {
        for name in &["scan.cl", "reduce.cl", "radixsort.cl"] {
            assert!(source(name).map_or(false, |s| !s.is_empty()), "missing {}", name);
        }
        assert!(source("fft.cl").is_none());
    }
}
