//! Generation-versioned identities for raw trace addresses.
//!
//! A traced runtime reuses heap addresses freely: a semaphore destroyed at
//! address `A` and another constructed at `A` later are different objects.
//! Every construction at an address bumps that address's generation, and
//! `(address, generation)` is the identity everything downstream keys on.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

/// True identity of a semaphore or vertex across address reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexId {
    pub address: u64,
    pub generation: u64,
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{:#x},{}>", self.address, self.generation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    ConstructOverLive { address: u64, generation: u64 },
    DestroyUnknown { address: u64 },
    DestroyDead { address: u64, generation: u64 },
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConstructOverLive {
                address,
                generation,
            } => write!(
                f,
                "construction at {address:#x} while generation {generation} is still live"
            ),
            Self::DestroyUnknown { address } => {
                write!(f, "destruction of unknown address {address:#x}")
            }
            Self::DestroyDead {
                address,
                generation,
            } => write!(
                f,
                "destruction at {address:#x} but generation {generation} is already dead"
            ),
        }
    }
}

impl Error for GenerationError {}

#[derive(Debug, Clone, Copy)]
struct Generation {
    version: u64,
    live: bool,
}

/// Tracks the current generation of every address seen in a run.
#[derive(Debug, Default)]
pub struct GenerationCounter {
    generations: HashMap<u64, Generation>,
}

impl GenerationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new generation at `address`.
    ///
    /// Fails (without mutating) if the current generation is still live;
    /// the caller decides whether to warn and [`rebind`](Self::rebind).
    pub fn construct(&mut self, address: u64) -> Result<VertexId, GenerationError> {
        match self.generations.get_mut(&address) {
            None => {
                self.generations.insert(
                    address,
                    Generation {
                        version: 0,
                        live: true,
                    },
                );
                Ok(VertexId {
                    address,
                    generation: 0,
                })
            }
            Some(generation) if generation.live => Err(GenerationError::ConstructOverLive {
                address,
                generation: generation.version,
            }),
            Some(generation) => {
                generation.version += 1;
                generation.live = true;
                Ok(VertexId {
                    address,
                    generation: generation.version,
                })
            }
        }
    }

    /// Force-starts a new generation, retiring a live one if necessary.
    pub fn rebind(&mut self, address: u64) -> VertexId {
        if let Some(generation) = self.generations.get_mut(&address) {
            generation.live = false;
        }
        match self.construct(address) {
            Ok(id) => id,
            // Unreachable: construct only fails on a live generation.
            Err(_) => self.rebind(address),
        }
    }

    /// Ends the current generation at `address` and returns its identity.
    pub fn destroy(&mut self, address: u64) -> Result<VertexId, GenerationError> {
        match self.generations.get_mut(&address) {
            None => Err(GenerationError::DestroyUnknown { address }),
            Some(generation) if !generation.live => Err(GenerationError::DestroyDead {
                address,
                generation: generation.version,
            }),
            Some(generation) => {
                generation.live = false;
                Ok(VertexId {
                    address,
                    generation: generation.version,
                })
            }
        }
    }

    /// Resolves `address` to its current identity.
    ///
    /// Addresses that were never constructed resolve to generation 0.
    /// Edges routinely reference vertices whose construction was not
    /// logged, and a re-normalized stream has no ctor events for them
    /// at all.
    pub fn current(&mut self, address: u64) -> VertexId {
        let generation = self.generations.entry(address).or_insert(Generation {
            version: 0,
            live: true,
        });
        VertexId {
            address,
            generation: generation.version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_reuse_gets_a_new_generation() {
        let mut counter = GenerationCounter::new();
        let first = counter.construct(0x10).expect("first construct");
        assert_eq!(first.generation, 0);
        counter.destroy(0x10).expect("destroy");
        let second = counter.construct(0x10).expect("second construct");
        assert_eq!(second.generation, 1);
        assert_ne!(first, second);
    }

    #[test]
    fn construct_over_live_fails_without_mutating() {
        let mut counter = GenerationCounter::new();
        counter.construct(0x10).expect("construct");
        let err = counter.construct(0x10).expect_err("must fail while live");
        assert_eq!(
            err,
            GenerationError::ConstructOverLive {
                address: 0x10,
                generation: 0
            }
        );
        // Still resolvable at the original generation.
        assert_eq!(counter.current(0x10).generation, 0);
    }

    #[test]
    fn rebind_retires_the_live_generation() {
        let mut counter = GenerationCounter::new();
        counter.construct(0x10).expect("construct");
        let rebound = counter.rebind(0x10);
        assert_eq!(rebound.generation, 1);
        counter.destroy(0x10).expect("rebound generation is live");
    }

    #[test]
    fn destroy_unknown_is_an_error() {
        let mut counter = GenerationCounter::new();
        let err = counter.destroy(0x99).expect_err("unknown address");
        assert_eq!(err, GenerationError::DestroyUnknown { address: 0x99 });
    }

    #[test]
    fn never_constructed_addresses_resolve_to_generation_zero() {
        let mut counter = GenerationCounter::new();
        let id = counter.current(0x42);
        assert_eq!(
            id,
            VertexId {
                address: 0x42,
                generation: 0
            }
        );
        // The lazy seed is live, so a destruction for it succeeds.
        assert_eq!(counter.destroy(0x42).expect("lazy seed is live"), id);
    }
}
