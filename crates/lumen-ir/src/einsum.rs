//! Einsum equation parsing.

use std::collections::BTreeMap;

use crate::error::IrError;

/// A parsed einsum equation such as `"bij,bjk->bik"`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EinsumEquation {
    /// Labels of each operand, outermost axis first.
    pub operands: Vec<Vec<char>>,
    /// Labels of the output.
    pub output: Vec<char>,
}

impl EinsumEquation {
    /// Parses an equation. Without `->` the output is every label that
    /// appears exactly once, in alphabetical order.
    pub fn parse(equation: &str) -> Result<Self, IrError> {
        let invalid = |reason: &str| IrError::InvalidEinsum {
            equation: equation.to_string(),
            reason: reason.to_string(),
        };
        if equation.contains("...") {
            return Err(invalid("ellipsis is not supported"));
        }
        let (lhs, rhs) = match equation.split_once("->") {
            Some((lhs, rhs)) => (lhs, Some(rhs)),
            None => (equation, None),
        };

        let parse_labels = |s: &str| -> Result<Vec<char>, IrError> {
            s.chars()
                .filter(|c| !c.is_whitespace())
                .map(|c| {
                    if c.is_ascii_alphabetic() {
                        Ok(c)
                    } else {
                        Err(invalid("labels must be ASCII letters"))
                    }
                })
                .collect()
        };

        let operands = lhs
            .split(',')
            .map(&parse_labels)
            .collect::<Result<Vec<_>, _>>()?;

        let output = match rhs {
            Some(rhs) => {
                let output = parse_labels(rhs)?;
                for (i, label) in output.iter().enumerate() {
                    if output[..i].contains(label) {
                        return Err(invalid("output label repeated"));
                    }
                    if !operands.iter().any(|op| op.contains(label)) {
                        return Err(invalid("output label not found in any operand"));
                    }
                }
                output
            }
            None => {
                let mut counts: BTreeMap<char, usize> = BTreeMap::new();
                for label in operands.iter().flatten() {
                    *counts.entry(*label).or_default() += 1;
                }
                counts
                    .into_iter()
                    .filter(|&(_, n)| n == 1)
                    .map(|(c, _)| c)
                    .collect()
            }
        };

        Ok(Self { operands, output })
    }

    /// Every distinct label in order of first appearance.
    pub fn labels(&self) -> Vec<char> {
        let mut labels = Vec::new();
        for &c in self.operands.iter().flatten().chain(&self.output) {
            if !labels.contains(&c) {
                labels.push(c);
            }
        }
        labels
    }

    /// Binds every label to a dimension size from the operand shapes.
    pub fn label_sizes(&self, shapes: &[&[usize]]) -> Result<BTreeMap<char, usize>, IrError> {
        if shapes.len() != self.operands.len() {
            return Err(IrError::IncompatibleShapes {
                lhs: format!("{} operands", self.operands.len()),
                rhs: format!("{} tensors", shapes.len()),
            });
        }
        let mut sizes = BTreeMap::new();
        for (labels, dims) in self.operands.iter().zip(shapes) {
            if labels.len() != dims.len() {
                return Err(IrError::IncompatibleShapes {
                    lhs: labels.iter().collect(),
                    rhs: format!("{dims:?}"),
                });
            }
            for (&label, &dim) in labels.iter().zip(dims.iter()) {
                let size = sizes.entry(label).or_insert(dim);
                if *size != dim {
                    return Err(IrError::IncompatibleShapes {
                        lhs: format!("{label}={size}"),
                        rhs: format!("{label}={dim}"),
                    });
                }
            }
        }
        Ok(sizes)
    }
}
