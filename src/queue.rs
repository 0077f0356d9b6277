//! Serialized settlement.
//!
//! Every producer (watcher, recovery scanner, retry reclaimer) pushes into
//! one unbounded FIFO channel. A single [`Settler`] pulls from it and takes
//! each event all the way to a SwapRecord or a FailedAttempt before looking
//! at the next one, so at most one payout from the custodial wallet is ever
//! in flight.

use alloy::primitives::Address;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::db::Ledger;
use crate::error::{ExecutionError, SettleError, Stage};
use crate::executor::{PayoutExecutor, PayoutStatus};
use crate::models::{PayoutIntent, SwapRecord, TransferEvent};
use crate::parser::decode_deposit;
use crate::price::PriceResolver;
use crate::settlement;

/// Producer side of the swap queue. Cheap to clone.
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<TransferEvent>,
    depth: Arc<AtomicUsize>,
}

/// Consumer side; exactly one exists.
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<TransferEvent>,
    depth: Arc<AtomicUsize>,
}

pub fn swap_queue() -> (QueueHandle, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        QueueHandle { tx, depth: Arc::clone(&depth) },
        QueueReceiver { rx, depth },
    )
}

impl QueueHandle {
    /// Appends to the tail. Returns false once the worker is gone.
    pub fn enqueue(&self, event: TransferEvent) -> bool {
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(event).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            error!("Swap queue closed; event dropped");
            return false;
        }
        true
    }

    pub fn enqueue_all(&self, events: Vec<TransferEvent>) -> usize {
        events.into_iter().map(|e| self.enqueue(e)).filter(|sent| *sent).count()
    }

    /// Events waiting behind the one being settled.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

impl QueueReceiver {
    pub async fn recv(&mut self) -> Option<TransferEvent> {
        let event = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(event)
    }
}

/// How a single event left the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Recorded(String),
    /// Settled before; nothing to do.
    AlreadySettled,
    /// Paid on chain but the SwapRecord write failed; the intent remains.
    PaidUnrecorded(String),
    /// Decode failure, dropped.
    Dropped,
    Failed,
}

#[derive(Debug)]
struct Failure {
    stage: Stage,
    error: SettleError,
}

impl Failure {
    fn at<E: Into<SettleError>>(stage: Stage) -> impl FnOnce(E) -> Failure {
        move |error| Failure { stage, error: error.into() }
    }
}

/// The single settlement worker.
pub struct Settler {
    ledger: Arc<dyn Ledger>,
    resolver: PriceResolver,
    executor: Arc<dyn PayoutExecutor>,
    listener: Address,
}

impl Settler {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        resolver: PriceResolver,
        executor: Arc<dyn PayoutExecutor>,
        listener: Address,
    ) -> Self {
        Self { ledger, resolver, executor, listener }
    }

    /// Drains the queue until every producer is gone. Never reentrant: the
    /// next event is only pulled once the current one is finished.
    pub async fn run(self, mut queue: QueueReceiver) {
        info!("Settlement worker started");
        while let Some(event) = queue.recv().await {
            let span = info_span!("settle", tx = %event.incoming_hash());
            self.settle(event).instrument(span).await;
        }
        info!("Swap queue closed; settlement worker stopped");
    }

    /// Takes one event to a terminal state. Never returns an error: failures
    /// are routed to the ledger or logged.
    pub async fn settle(&self, event: TransferEvent) -> Outcome {
        match self.process(&event).await {
            Ok(outcome) => outcome,
            Err(Failure { error: SettleError::Decode(e), .. }) => {
                warn!("Dropping undecodable event: {}", e);
                Outcome::Dropped
            }
            Err(Failure { stage, error }) => {
                warn!("Settlement failed while {}: {}", stage, error);
                self.record_failure(&event, stage, &error).await;
                debug!("-> {}", Stage::Failed);
                Outcome::Failed
            }
        }
    }

    async fn record_failure(&self, event: &TransferEvent, stage: Stage, error: &SettleError) {
        let serialized = match serde_json::to_string(&event.pinned()) {
            Ok(json) => json,
            Err(e) => {
                error!("Could not serialize failed event: {}", e);
                return;
            }
        };
        let message = format!("[{}] {}", stage, error);
        if let Err(e) = self.ledger.insert_failed_attempt(&serialized, &message).await {
            error!("Could not store failed attempt, event lost: {}", e);
        }
    }

    async fn process(&self, event: &TransferEvent) -> Result<Outcome, Failure> {
        let transfer = decode_deposit(&event.log, &self.listener)
            .map_err(Failure::at(Stage::Pending))?;
        let incoming = transfer.tx_hash.clone();

        if self
            .ledger
            .exists_by_incoming_hash(&incoming)
            .await
            .map_err(Failure::at(Stage::Pending))?
        {
            debug!("Already settled, skipping");
            return Ok(Outcome::AlreadySettled);
        }

        let open = self
            .ledger
            .find_intent(&incoming)
            .await
            .map_err(Failure::at(Stage::Pending))?;
        if let Some(intent) = open {
            // None: the earlier payout will never land, settle afresh
            if let Some(outcome) = self.reconcile(intent).await? {
                return Ok(outcome);
            }
        }

        debug!("-> {}", Stage::Resolving);
        let price = self.resolver.resolve(event.block_number).await;
        if price.is_zero() {
            return Err(Failure {
                stage: Stage::Resolving,
                error: SettleError::PriceResolution(match event.block_number {
                    Some(block) => format!("no price for block {}", block),
                    None => "no spot price".to_string(),
                }),
            });
        }

        debug!("-> {} at price {}", Stage::Computing, price);
        let settlement = settlement::compute(transfer.value, price)
            .map_err(Failure::at(Stage::Computing))?;
        info!(
            "Received {} (fee {}), paying {} to {} at {}",
            transfer.value, settlement.fee, settlement.payout, transfer.from, price
        );

        let intent = PayoutIntent {
            sender: transfer.from,
            usdc_received: transfer.value,
            arb_amount: settlement.payout,
            arb_price: price,
            fee: settlement.fee,
            block_number: transfer.block_number,
            incoming_tx_hash: incoming,
            payout: None,
        };
        self.pay(intent).await
    }

    async fn pay(&self, intent: PayoutIntent) -> Result<Outcome, Failure> {
        debug!("-> {}", Stage::Submitting);
        let incoming = intent.incoming_tx_hash.clone();
        self.ledger
            .open_intent(&intent)
            .await
            .map_err(Failure::at(Stage::Submitting))?;

        // nothing has left the process until broadcast
        let payout = match self.executor.sign(intent.sender, intent.arb_amount).await {
            Ok(payout) => payout,
            Err(e) => {
                self.clear_intent(&incoming).await;
                return Err(Failure::at(Stage::Submitting)(e));
            }
        };
        if let Err(e) = self.ledger.attach_payout(&incoming, &payout).await {
            self.clear_intent(&incoming).await;
            return Err(Failure::at(Stage::Submitting)(e));
        }

        // from here on the intent holds the hash and outlives any failure
        self.executor
            .broadcast(&payout)
            .await
            .map_err(Failure::at(Stage::Submitting))?;

        debug!("-> {}", Stage::Confirming);
        match self.executor.confirm(&payout.hash).await {
            Ok(confirmed) => {
                info!("{}, confirmed", confirmed);
                Ok(self.record(intent.into_record(confirmed)).await)
            }
            Err(e @ ExecutionError::Reverted(_)) => {
                self.clear_intent(&incoming).await;
                Err(Failure::at(Stage::Confirming)(e))
            }
            Err(e) => Err(Failure::at(Stage::Confirming)(e)),
        }
    }

    /// Resolves an intent left by an earlier attempt without paying twice.
    /// `Ok(None)` means the earlier payout can never land, so the event is
    /// settled afresh.
    async fn reconcile(&self, intent: PayoutIntent) -> Result<Option<Outcome>, Failure> {
        let incoming = intent.incoming_tx_hash.clone();
        let Some(payout) = intent.payout.clone() else {
            // the crash came before signing finished; nothing was broadcast
            warn!("Discarding payout intent that was never signed");
            self.ledger.clear_intent(&incoming).await.map_err(Failure::at(Stage::Pending))?;
            return Ok(None);
        };

        debug!("Reconciling earlier payout {} (nonce {})", payout.hash, payout.nonce);
        match self
            .executor
            .payout_status(&payout.hash, payout.nonce)
            .await
            .map_err(Failure::at(Stage::Confirming))?
        {
            PayoutStatus::Succeeded => {
                info!("Earlier payout {} landed; recording it", payout.hash);
                Ok(Some(self.record(intent.into_record(payout.hash)).await))
            }
            status @ (PayoutStatus::Reverted | PayoutStatus::Dropped) => {
                warn!("Earlier payout {} {:?}; settling again", payout.hash, status);
                self.ledger.clear_intent(&incoming).await.map_err(Failure::at(Stage::Pending))?;
                Ok(None)
            }
            PayoutStatus::Pending => {
                error!(
                    "Payout {} (nonce {}) is still not mined; rebroadcasting it",
                    payout.hash, payout.nonce
                );
                if let Err(e) = self.executor.broadcast(&payout).await {
                    warn!("Rebroadcast failed: {}", e);
                }
                Err(Failure::at(Stage::Confirming)(ExecutionError::Unconfirmed {
                    hash: payout.hash,
                    reason: "not mined yet".to_string(),
                }))
            }
        }
    }

    async fn record(&self, record: SwapRecord) -> Outcome {
        let outgoing = record.outgoing_tx_hash.clone();
        match self.ledger.complete_swap(&record).await {
            Ok(_) => {
                debug!("-> {}", Stage::Recorded);
                info!("Swap recorded");
                Outcome::Recorded(outgoing)
            }
            Err(e) => {
                error!(
                    "Payout {} confirmed but not recorded: {}; the payout intent is kept",
                    outgoing, e
                );
                Outcome::PaidUnrecorded(outgoing)
            }
        }
    }

    async fn clear_intent(&self, incoming: &str) {
        if let Err(e) = self.ledger.clear_intent(incoming).await {
            error!("Could not clear payout intent: {}", e);
        }
    }
}
