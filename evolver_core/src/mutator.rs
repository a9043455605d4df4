use crate::corpus::{Bin, CorpusStore};
use crate::vector::{CertificateStructure, ExecutionMode, ProtocolAction, TestVector, Trace};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Upper bound for the payload of an action synthesized by the structural strategy.
const MAX_RANDOM_PAYLOAD_LEN: usize = 64;

/// The certificate structures a campaign may present on either side.
#[derive(Debug, Clone, Default)]
pub struct CertificatePool {
    server: Vec<CertificateStructure>,
    client: Vec<CertificateStructure>,
}

impl CertificatePool {
    pub fn new(server: Vec<CertificateStructure>, client: Vec<CertificateStructure>) -> Self {
        Self { server, client }
    }

    fn pick<R: Rng + ?Sized>(choices: &[CertificateStructure], rng: &mut R) -> CertificateStructure {
        if choices.is_empty() {
            return CertificateStructure::default();
        }
        choices[rng.random_range(0..choices.len())].clone()
    }

    pub fn random_server<R: Rng + ?Sized>(&self, rng: &mut R) -> CertificateStructure {
        Self::pick(&self.server, rng)
    }

    pub fn random_client<R: Rng + ?Sized>(&self, rng: &mut R) -> CertificateStructure {
        Self::pick(&self.client, rng)
    }
}

/// How a selected base vector is changed before it is executed.
///
/// The set is closed and picked once from configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MutationStrategy {
    /// Replays the base vector unchanged.
    #[default]
    None,
    /// Swaps the server certificate, the client certificate, or both.
    Certificate,
    /// Edits the shape or the payloads of the trace.
    Structural,
}

/// One edit applied by [`MutationStrategy::Structural`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StructuralEdit {
    Duplicate,
    Remove,
    Swap,
    FlipByte,
    Append,
}

impl StructuralEdit {
    const ALL: [StructuralEdit; 5] = [
        StructuralEdit::Duplicate,
        StructuralEdit::Remove,
        StructuralEdit::Swap,
        StructuralEdit::FlipByte,
        StructuralEdit::Append,
    ];
}

impl MutationStrategy {
    pub fn apply<R: Rng + ?Sized>(
        &self,
        vector: &mut TestVector,
        certificates: &CertificatePool,
        rng: &mut R,
    ) {
        match self {
            MutationStrategy::None => {}
            MutationStrategy::Certificate => match rng.random_range(0..3) {
                0 => vector.server_certificate = certificates.random_server(rng),
                1 => vector.client_certificate = certificates.random_client(rng),
                _ => {
                    vector.server_certificate = certificates.random_server(rng);
                    vector.client_certificate = certificates.random_client(rng);
                }
            },
            MutationStrategy::Structural => {
                let edit = StructuralEdit::ALL[rng.random_range(0..StructuralEdit::ALL.len())];
                apply_structural_edit(&mut vector.trace, edit, rng);
            }
        }
    }
}

fn apply_structural_edit<R: Rng + ?Sized>(trace: &mut Trace, edit: StructuralEdit, rng: &mut R) {
    let len = trace.actions.len();
    let with_payload: Vec<usize> = trace
        .actions
        .iter()
        .enumerate()
        .filter(|(_, action)| !action.payload.is_empty())
        .map(|(index, _)| index)
        .collect();
    // Swapping equal actions would leave the trace unchanged.
    let distinct_pairs: Vec<(usize, usize)> = if edit == StructuralEdit::Swap {
        (0..len)
            .flat_map(|a| (a + 1..len).map(move |b| (a, b)))
            .filter(|&(a, b)| trace.actions[a] != trace.actions[b])
            .collect()
    } else {
        Vec::new()
    };

    match edit {
        StructuralEdit::Duplicate if len > 0 => {
            let index = rng.random_range(0..len);
            let copy = trace.actions[index].clone();
            trace.actions.insert(index + 1, copy);
        }
        // Never empty a trace that had actions.
        StructuralEdit::Remove if len > 1 => {
            trace.actions.remove(rng.random_range(0..len));
        }
        StructuralEdit::Swap if !distinct_pairs.is_empty() => {
            let (first, second) = distinct_pairs[rng.random_range(0..distinct_pairs.len())];
            trace.actions.swap(first, second);
        }
        StructuralEdit::FlipByte if !with_payload.is_empty() => {
            let action = &mut trace.actions[with_payload[rng.random_range(0..with_payload.len())]];
            let byte_index = rng.random_range(0..action.payload.len());
            let delta = rng.random_range(1u8..=15u8);
            action.payload[byte_index] = action.payload[byte_index].wrapping_add(delta);
        }
        _ => {
            let payload_len = rng.random_range(1..=MAX_RANDOM_PAYLOAD_LEN);
            let payload = (0..payload_len).map(|_| rng.random()).collect();
            trace.actions.push(ProtocolAction::send("Random", payload));
        }
    }
}

/// Produces the next candidate of a campaign.
///
/// Bases come from the good bin while it has entries, then from the archive
/// bin, and otherwise are synthesized with an empty trace. Loading failures
/// are logged and the next tier is tried; selection itself never fails.
pub struct Mutator<R: Rng> {
    strategy: MutationStrategy,
    corpus: CorpusStore,
    certificates: CertificatePool,
    modes: Vec<ExecutionMode>,
    rng: R,
}

impl<R: Rng> Mutator<R> {
    pub fn new(
        strategy: MutationStrategy,
        corpus: CorpusStore,
        certificates: CertificatePool,
        modes: Vec<ExecutionMode>,
        rng: R,
    ) -> Self {
        Self {
            strategy,
            corpus,
            certificates,
            modes,
            rng,
        }
    }

    pub fn strategy(&self) -> MutationStrategy {
        self.strategy
    }

    /// Returns a vector owned solely by the caller, ready to execute.
    pub fn next_candidate(&mut self) -> TestVector {
        let mut vector = self.select_base();
        vector.trace.reset();
        vector.trace.make_generic();
        self.strategy
            .apply(&mut vector, &self.certificates, &mut self.rng);
        vector
    }

    fn select_base(&mut self) -> TestVector {
        for bin in [Bin::Good, Bin::Archive] {
            match self.corpus.random_entry(bin, &mut self.rng) {
                Ok(Some(vector)) => {
                    debug!(%bin, "selected base vector");
                    return vector;
                }
                Ok(None) => {}
                Err(e) => error!(%bin, error = %e, "could not read base vector, trying next tier"),
            }
        }
        self.synthesize()
    }

    fn synthesize(&mut self) -> TestVector {
        debug!("synthesizing fresh vector");
        TestVector::new(
            Trace::default(),
            self.certificates.random_server(&mut self.rng),
            self.certificates.random_client(&mut self.rng),
            ExecutionMode::random(&self.modes, &mut self.rng),
        )
    }
}
