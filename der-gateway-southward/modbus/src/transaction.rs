use crate::{
    bits::BitSet,
    network::{ModbusConnection, ModbusNetwork},
    planner::{AddressRange, AddressRangeSet},
    store::{RegisterData, RegisterStore},
    types::ModbusReadFunction,
};
use der_gateway_sdk::{DriverError, DriverResult};
use std::sync::Arc;
use tracing::debug;

/// Register words read from a device, keyed by start address.
pub type WordBlocks = Vec<(u16, Vec<u16>)>;

/// Runs read/write round trips for one unit and commits the results to a [`RegisterStore`].
///
/// The device I/O and the store commit happen under one hold of the transport lock, so
/// executors sharing a network commit in the order they read.
#[derive(Debug, Clone)]
pub struct TransactionExecutor {
    network: Arc<ModbusNetwork>,
    unit_id: u8,
}

impl TransactionExecutor {
    pub fn new(network: Arc<ModbusNetwork>, unit_id: u8) -> Self {
        Self { network, unit_id }
    }

    #[inline]
    pub fn network(&self) -> &Arc<ModbusNetwork> {
        &self.network
    }

    #[inline]
    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    /// Run `work` against an open connection, save the returned blocks into `store`, and
    /// return a snapshot taken in the same critical section.
    ///
    /// The connection stays open until the commit is done. The timestamp advances when
    /// `work` returned at least one block. If `work` fails the store is left untouched.
    pub fn execute<F>(&self, store: &RegisterStore, mut work: F) -> DriverResult<RegisterData>
    where
        F: FnMut(&mut ModbusConnection<'_>) -> DriverResult<WordBlocks>,
    {
        self.network.perform_action(self.unit_id, |conn| {
            let blocks = work(conn)?;
            store.update_and_copy(|tx| {
                for (address, words) in &blocks {
                    tx.save_words(*address, words)?;
                }
                Ok(!blocks.is_empty())
            })
        })
    }

    /// Run `work` against an open connection without touching any store.
    pub fn perform<T, F>(&self, work: F) -> DriverResult<T>
    where
        F: FnMut(&mut ModbusConnection<'_>) -> DriverResult<T>,
    {
        self.network.perform_action(self.unit_id, work)
    }

    /// Read every address in `ranges` with `function` and commit the words in one update.
    ///
    /// Ranges are combined to reduce the request count and chunked to `max_read_len` words.
    pub fn refresh(
        &self,
        store: &RegisterStore,
        function: ModbusReadFunction,
        ranges: &AddressRangeSet,
        max_read_len: u16,
    ) -> DriverResult<RegisterData> {
        if function.block_type().is_bit_type() {
            return Err(DriverError::ValidationError(format!(
                "{function:?} reads bits, not registers"
            )));
        }
        let plan = Self::plan(ranges, max_read_len)?;
        debug!(unit_id = self.unit_id, ?function, requests = plan.len(), ranges = %ranges, "Refreshing registers");
        self.execute(store, |conn| {
            let mut blocks = Vec::with_capacity(plan.len());
            for r in &plan {
                let words = conn.read_words(function, r.min(), r.len() as u16)?;
                blocks.push((r.min(), words));
            }
            Ok(blocks)
        })
    }

    /// Read coils or discrete inputs covering `ranges`; bit `i` of the result is address `i`.
    pub fn read_bits(
        &self,
        function: ModbusReadFunction,
        ranges: &AddressRangeSet,
        max_read_len: u16,
    ) -> DriverResult<BitSet> {
        if !function.block_type().is_bit_type() {
            return Err(DriverError::ValidationError(format!(
                "{function:?} reads registers, not bits"
            )));
        }
        let plan = Self::plan(ranges, max_read_len)?;
        debug!(unit_id = self.unit_id, ?function, requests = plan.len(), ranges = %ranges, "Refreshing bits");
        self.perform(|conn| {
            let mut bits = BitSet::new();
            for r in &plan {
                let values = conn.read_bits(function, r.min(), r.len() as u16)?;
                for (i, v) in values.into_iter().enumerate() {
                    bits.set(usize::from(r.min()) + i, v);
                }
            }
            Ok(bits)
        })
    }

    fn plan(ranges: &AddressRangeSet, max_read_len: u16) -> DriverResult<Vec<AddressRange>> {
        ranges
            .combine_to_reduce_size(u32::from(max_read_len))?
            .split_to_max_length(max_read_len)
    }
}
