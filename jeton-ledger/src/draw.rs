//! Tombola draw
//!
//! Selection is a pure function of the eligible tickets, the open prizes and
//! an injected RNG. [`DrawEngine`] wraps it with persistence: it locks the
//! tombola, gathers the pools, assigns and writes the winners in one unit of
//! work.
//!
//! # Guarantees
//!
//! - A ticket wins at most one prize, a prize is awarded at most once
//! - `winners == min(eligible tickets, open prizes)`
//! - Extra prizes stay unassigned; a later draw can still award them

use crate::{
    error::{Error, Result},
    storage::{Lock, Storage},
    types::{PrizeId, Ticket, TicketId, TombolaId, WinnerRecord},
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;

/// Prize to ticket assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    /// Prize awarded
    pub prize_id: PrizeId,
    /// Winning ticket
    pub ticket_id: TicketId,
}

/// Audit record of one draw
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawReceipt {
    /// Tombola drawn
    pub tombola_id: TombolaId,
    /// Winners in prize order
    pub winners: Vec<WinnerRecord>,
    /// Open prizes left without a ticket
    pub unassigned_prizes: Vec<PrizeId>,
    /// Size of the eligible ticket pool
    pub eligible_tickets: usize,
    /// Hex SHA-256 over the ordered assignments
    pub digest: String,
}

/// In-place Fisher–Yates shuffle
pub fn shuffle<T, R: Rng + ?Sized>(items: &mut [T], rng: &mut R) {
    for i in (1..items.len()).rev() {
        let j = rng.gen_range(0..=i);
        items.swap(i, j);
    }
}

/// Assign prizes, in order, to a shuffled copy of the ticket pool
///
/// Every ticket must be unwon. Assignment stops when either pool runs out.
pub fn select_winners<R: Rng + ?Sized>(
    tickets: &[Ticket],
    prizes: &[PrizeId],
    rng: &mut R,
) -> Result<Vec<Assignment>> {
    if let Some(ticket) = tickets.iter().find(|t| t.won) {
        return Err(Error::Validation(format!(
            "Ticket {} has already won and cannot enter a draw",
            ticket.id
        )));
    }

    let mut pool: Vec<TicketId> = tickets.iter().map(|t| t.id).collect();
    let mut seen = HashSet::with_capacity(pool.len());
    if !pool.iter().all(|id| seen.insert(*id)) {
        return Err(Error::Validation("Ticket pool contains duplicates".to_string()));
    }
    shuffle(&mut pool, rng);

    Ok(prizes
        .iter()
        .zip(pool)
        .map(|(prize_id, ticket_id)| Assignment {
            prize_id: *prize_id,
            ticket_id,
        })
        .collect())
}

/// Digest of a draw's assignments
pub fn receipt_digest(tombola_id: TombolaId, assignments: &[Assignment]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tombola_id.to_key());
    for assignment in assignments {
        hasher.update(assignment.prize_id.to_key());
        hasher.update(assignment.ticket_id.to_key());
    }
    hex::encode(hasher.finalize())
}

/// Persisting draw engine
#[derive(Debug)]
pub struct DrawEngine {
    storage: Arc<Storage>,
}

impl DrawEngine {
    /// Create engine over `storage`
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Draw with a non-reproducible RNG
    pub fn perform_draw(&self, tombola_id: TombolaId) -> Result<DrawReceipt> {
        let mut rng = StdRng::from_entropy();
        self.perform_draw_with(tombola_id, &mut rng)
    }

    /// Draw with the given RNG
    pub fn perform_draw_with<R: Rng + ?Sized>(
        &self,
        tombola_id: TombolaId,
        rng: &mut R,
    ) -> Result<DrawReceipt> {
        let receipt = self.storage.in_unit_of_work(|uow| {
            let mut tombola = uow.tombola(tombola_id, Lock::Exclusive)?;

            let awarded: HashSet<PrizeId> = uow
                .winners_for_tombola(tombola_id)?
                .into_iter()
                .map(|w| w.prize_id)
                .collect();
            let open_prizes: Vec<PrizeId> = tombola
                .prizes
                .iter()
                .copied()
                .filter(|p| !awarded.contains(p))
                .collect();
            let eligible: Vec<Ticket> = uow
                .tickets_for_tombola(tombola_id)?
                .into_iter()
                .filter(|t| !t.won)
                .collect();

            if eligible.is_empty() {
                return Err(Error::NoTicketsAvailable(tombola_id));
            }
            if open_prizes.is_empty() {
                return Err(Error::NoLotsAvailable(tombola_id));
            }

            let assignments = select_winners(&eligible, &open_prizes, rng)?;
            if assignments.is_empty() {
                return Err(Error::NoWinnersSelected(tombola_id));
            }

            let mut winners = Vec::with_capacity(assignments.len());
            for assignment in &assignments {
                let mut ticket = uow.ticket_for_update(assignment.ticket_id)?;
                if ticket.won {
                    return Err(Error::Validation(format!(
                        "Ticket {} has already won",
                        ticket.id
                    )));
                }
                ticket.won = true;
                uow.put_ticket(&ticket)?;
                winners.push(uow.append_winner(
                    tombola_id,
                    assignment.prize_id,
                    ticket.id,
                    ticket.owner_account_id,
                )?);
            }

            tombola.draw_count += 1;
            uow.put_tombola(&tombola)?;

            Ok(DrawReceipt {
                tombola_id,
                unassigned_prizes: open_prizes[assignments.len()..].to_vec(),
                eligible_tickets: eligible.len(),
                digest: receipt_digest(tombola_id, &assignments),
                winners,
            })
        });

        match &receipt {
            Ok(receipt) => tracing::info!(
                tombola_id = %tombola_id,
                winners = receipt.winners.len(),
                unassigned = receipt.unassigned_prizes.len(),
                eligible = receipt.eligible_tickets,
                digest = %receipt.digest,
                "Draw committed"
            ),
            Err(err) => tracing::warn!(tombola_id = %tombola_id, error = %err, "Draw rejected"),
        }

        receipt
    }
}
