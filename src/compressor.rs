//! Constant-run compressor: eliminates redundant consecutive samples while
//! honoring a maximum time-gap bound. Grounded on
//! `vzclient/compress.py::compress_const`.

/// One `(x, y)` node of a time series. Used generically so the compressor
/// can run over raw `(i64, f64)` pairs as well as `Sample`s.
pub type Node = (i64, f64);

/// Stateful constant-run compressor.
///
/// Consumes a sequence of `(x, y)` pairs (x must be non-decreasing; a
/// duplicate `x` is silently dropped) and emits a sub-sequence that
/// preserves every value transition and, when `max_gap` is set, inserts
/// anchor points so no two emitted points spanning an equal-value run are
/// more than `max_gap` apart in `x`.
pub struct Compressor {
    max_gap: Option<i64>,
    anchor: Option<Node>,
    last_same: Option<Node>,
}

impl Compressor {
    pub fn new(max_gap: Option<i64>) -> Self {
        Self {
            max_gap,
            anchor: None,
            last_same: None,
        }
    }

    /// Feed one `(x, y)` pair, returning any points that become emittable.
    pub fn push(&mut self, node: Node) -> Vec<Node> {
        let (x, y) = node;
        let mut out = Vec::new();

        let (Some((x0, y0)), Some((xn, yn))) = (self.anchor, self.last_same) else {
            // First sample: seed both anchors, emit nothing yet.
            self.anchor = Some(node);
            self.last_same = Some(node);
            return out;
        };

        if x == xn {
            // Duplicate x: drop.
            return out;
        }

        if y == yn {
            if let Some(max_gap) = self.max_gap {
                if x - x0 > max_gap {
                    out.push((x0, y0));
                    self.anchor = Some((xn, yn));
                }
            }
            self.last_same = Some((x, yn));
            return out;
        }

        // Value changed: close out the previous run.
        out.push((x0, y0));
        if xn != x0 {
            out.push((xn, yn));
        }
        self.anchor = Some(node);
        self.last_same = Some(node);
        out
    }

    /// Flush any pending anchor/last-same points at end of stream.
    pub fn finish(mut self) -> Vec<Node> {
        let mut out = Vec::new();
        if let (Some((x0, y0)), Some((xn, yn))) = (self.anchor.take(), self.last_same.take()) {
            out.push((x0, y0));
            if xn != x0 {
                out.push((xn, yn));
            }
        }
        out
    }
}

/// Convenience one-shot compression of a whole sequence (used by the bulk
/// copy pipeline, which compresses one chunk's worth of samples at a time
/// while keeping a `Compressor` alive across chunks).
pub fn compress_const(iter: impl IntoIterator<Item = Node>, max_gap: Option<i64>) -> Vec<Node> {
    let mut compressor = Compressor::new(max_gap);
    let mut out = Vec::new();
    for node in iter {
        out.extend(compressor.push(node));
    }
    out.extend(compressor.finish());
    out
}

#[cfg(test)]
mod test {
    use super::compress_const;

    #[test]
    fn empty_input_yields_empty_output() {
        assert_eq!(compress_const(vec![], None), vec![]);
    }

    #[test]
    fn single_input_yields_single_output_at_finish() {
        assert_eq!(compress_const(vec![(1, 1.0)], None), vec![(1, 1.0)]);
    }

    #[test]
    fn basic_scenario_no_gap() {
        // spec.md §8 scenario 1
        let input = vec![(1, 1.0), (2, 1.0), (3, 1.0), (5, 1.0), (6, 1.0)];
        assert_eq!(compress_const(input, None), vec![(1, 1.0), (6, 1.0)]);
    }

    #[test]
    fn gap_of_four() {
        // spec.md §8 scenario 2
        let input = vec![(1, 1.0), (2, 1.0), (3, 1.0), (5, 1.0), (6, 1.0)];
        assert_eq!(
            compress_const(input, Some(4)),
            vec![(1, 1.0), (5, 1.0), (6, 1.0)]
        );
    }

    #[test]
    fn gap_of_three_six_points() {
        // spec.md §8 scenario 3
        let input = vec![
            (1, 1.0),
            (2, 1.0),
            (3, 1.0),
            (5, 1.0),
            (6, 1.0),
            (7, 1.0),
        ];
        assert_eq!(
            compress_const(input, Some(3)),
            vec![(1, 1.0), (3, 1.0), (6, 1.0), (7, 1.0)]
        );
    }

    #[test]
    fn value_transition() {
        // spec.md §8 scenario 4, x scaled by 10 since Node::x is i64
        // (spec uses fractional x: [(1.1,1.1),(1.2,1.2),(1.3,1.2),(5,1.2),(6,1.3)])
        let input = vec![(11, 1.1), (12, 1.2), (13, 1.2), (50, 1.2), (60, 1.3)];
        assert_eq!(
            compress_const(input, None),
            vec![(11, 1.1), (12, 1.2), (50, 1.2), (60, 1.3)]
        );
    }

    #[test]
    fn all_equal_with_no_max_gap_keeps_only_first_and_last() {
        let input: Vec<_> = (0..20).map(|i| (i, 7.0)).collect();
        assert_eq!(compress_const(input, None), vec![(0, 7.0), (19, 7.0)]);
    }

    #[test]
    fn duplicate_x_is_dropped() {
        let input = vec![(1, 1.0), (1, 2.0), (2, 2.0)];
        assert_eq!(compress_const(input, None), vec![(1, 1.0), (2, 2.0)]);
    }

    #[test]
    fn no_two_consecutive_equal_outputs_span_more_than_max_gap() {
        let input: Vec<_> = (0..50).map(|i| (i, 3.0)).collect();
        let out = compress_const(input, Some(10));
        for w in out.windows(2) {
            let (x0, y0) = w[0];
            let (x1, y1) = w[1];
            if y0 == y1 {
                assert!(x1 - x0 <= 10);
            }
        }
    }
}

#[cfg(test)]
mod proptest_invariants {
    use super::compress_const;
    use proptest::prelude::*;

    proptest! {
        // spec.md §8 "For any input sequence S with max_gap = null, the
        // output O is a sub-sequence of S; O[0] == S[0]; O[-1] == S[-1];
        // consecutive output pairs never have equal y; every y-transition
        // in S appears in O."
        #[test]
        fn output_is_subsequence_with_endpoints_and_no_equal_run(
            xs in proptest::collection::vec(0i64..500, 1..40),
            ys in proptest::collection::vec(0u8..4, 1..40),
        ) {
            let mut xs_sorted = xs.clone();
            xs_sorted.sort_unstable();
            xs_sorted.dedup();
            prop_assume!(!xs_sorted.is_empty());

            let input: Vec<(i64, f64)> = xs_sorted
                .iter()
                .enumerate()
                .map(|(i, &x)| (x, ys[i % ys.len()] as f64))
                .collect();

            let output = compress_const(input.clone(), None);

            prop_assert_eq!(output.first(), input.first());
            prop_assert_eq!(output.last(), input.last());
            for w in output.windows(2) {
                prop_assert_ne!(w[0].1, w[1].1);
            }
            for point in &output {
                prop_assert!(input.contains(point));
            }
        }

        // spec.md §8 "no two consecutive outputs (x_i,y_i),(x_{i+1},y_{i+1})
        // with y_i == y_{i+1} have x_{i+1} − x_i > max_gap."
        #[test]
        fn gapped_output_never_exceeds_max_gap_between_equal_values(
            xs in proptest::collection::vec(0i64..500, 1..40),
            max_gap in 1i64..50,
        ) {
            let mut xs_sorted = xs.clone();
            xs_sorted.sort_unstable();
            xs_sorted.dedup();
            prop_assume!(!xs_sorted.is_empty());

            let input: Vec<(i64, f64)> = xs_sorted.iter().map(|&x| (x, 1.0)).collect();
            let output = compress_const(input, Some(max_gap));

            for w in output.windows(2) {
                let (x0, y0) = w[0];
                let (x1, y1) = w[1];
                if y0 == y1 {
                    prop_assert!(x1 - x0 <= max_gap);
                }
            }
        }
    }
}
