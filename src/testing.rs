//! In-memory fakes for the external seams, shared by unit tests

use crate::balances::BalanceAggregator;
use crate::chain::{f64_to_units, ChainReader};
use crate::config::{ExecutionConfig, QuoteConfig, SafetyPolicy};
use crate::deposit_monitor::DepositMonitor;
use crate::executor::{SubmissionReceipt, Submitters, TransactionExecutor, TransactionSubmitter};
use crate::export_gate::ExportSafetyGate;
use crate::pricing::{PriceOracleCache, PriceSource, SourcePrice};
use crate::protocols::{IMToken, PreparedCall, ProtocolKind, IERC4626};
use crate::quote::{ProviderKind, Quote, QuoteProvider, QuoteRequest, QuoteRouter, QuoteTransaction};
use crate::reconcile::PositionReconciler;
use crate::store::{Database, PositionRecord, WalletRecord};
use crate::tokens::registry;
use crate::wallet::{EncryptedKeyStore, SecureWallet};
use crate::{Error, Result};
use alloy::primitives::{address, Address, Bytes, U256};
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use secrecy::SecretString;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ERC20_TRANSFER: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];
const STUB_ROUTER: Address = address!("1111111254eeb25477b68fb85ed929f73a960582");

fn wad() -> U256 {
    U256::from(10u64).pow(U256::from(18u64))
}

/// Chain state held in maps. Unknown decimals fall back to the token
/// registry, then to 6 (receipt tokens for USDC markets). Share tokens
/// convert 1:1 to assets until an exchange rate is set.
#[derive(Default)]
pub(crate) struct FakeChain {
    balances: Mutex<HashMap<(Address, Address), U256>>,
    native: Mutex<HashMap<Address, U256>>,
    decimals: Mutex<HashMap<Address, u8>>,
    exchange_rates: Mutex<HashMap<Address, U256>>,
    failing: Mutex<HashSet<Address>>,
    fail_all: AtomicBool,
}

impl FakeChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, token: Address, owner: Address, raw: U256) {
        self.balances.lock().unwrap().insert((token, owner), raw);
    }

    /// Set a balance in whole tokens
    pub fn set_units(&self, token: Address, owner: Address, amount: f64) {
        let raw = f64_to_units(amount, self.decimals_of(token)).unwrap();
        self.set_balance(token, owner, raw);
    }

    pub fn set_native(&self, owner: Address, raw: U256) {
        self.native.lock().unwrap().insert(owner, raw);
    }

    pub fn set_decimals(&self, token: Address, decimals: u8) {
        self.decimals.lock().unwrap().insert(token, decimals);
    }

    /// Assets per share scaled by 1e18, the cToken mantissa convention
    pub fn set_exchange_rate(&self, token: Address, mantissa: U256) {
        self.exchange_rates.lock().unwrap().insert(token, mantissa);
    }

    /// Exchange rate for a share token with the same decimals as its asset
    pub fn set_share_price(&self, token: Address, assets_per_share: f64) {
        self.set_exchange_rate(token, f64_to_units(assets_per_share, 18).unwrap());
    }

    /// Make every read of `token` fail
    pub fn fail_token(&self, token: Address) {
        self.failing.lock().unwrap().insert(token);
    }

    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn balance(&self, token: Address, owner: Address) -> U256 {
        self.balances
            .lock()
            .unwrap()
            .get(&(token, owner))
            .copied()
            .unwrap_or_default()
    }

    pub fn native(&self, owner: Address) -> U256 {
        self.native.lock().unwrap().get(&owner).copied().unwrap_or_default()
    }

    fn move_erc20(&self, token: Address, from: Address, to: Address, amount: U256) {
        let mut balances = self.balances.lock().unwrap();
        let held = balances.get(&(token, from)).copied().unwrap_or_default();
        balances.insert((token, from), held.saturating_sub(amount));
        *balances.entry((token, to)).or_default() += amount;
    }

    fn move_native(&self, from: Address, to: Address, amount: U256) {
        let mut native = self.native.lock().unwrap();
        let held = native.get(&from).copied().unwrap_or_default();
        native.insert(from, held.saturating_sub(amount));
        *native.entry(to).or_default() += amount;
    }

    fn decimals_of(&self, token: Address) -> u8 {
        self.decimals
            .lock()
            .unwrap()
            .get(&token)
            .copied()
            .or_else(|| registry().get(&token).map(|t| t.decimals))
            .unwrap_or(6)
    }

    fn exchange_rate(&self, token: Address) -> U256 {
        self.exchange_rates
            .lock()
            .unwrap()
            .get(&token)
            .copied()
            .unwrap_or_else(wad)
    }

    fn check(&self, token: Address) -> Result<()> {
        if self.fail_all.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(&token) {
            return Err(Error::Chain(format!("eth_call to {} failed", token)));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainReader for FakeChain {
    async fn erc20_balance(&self, token: Address, owner: Address) -> Result<U256> {
        self.check(token)?;
        Ok(self.balance(token, owner))
    }

    async fn erc20_decimals(&self, token: Address) -> Result<u8> {
        self.check(token)?;
        Ok(self.decimals_of(token))
    }

    async fn native_balance(&self, owner: Address) -> Result<U256> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(Error::Chain("eth_getBalance failed".to_string()));
        }
        Ok(self.native(owner))
    }

    async fn call(&self, to: Address, calldata: Vec<u8>) -> Result<Bytes> {
        self.check(to)?;
        let rate = self.exchange_rate(to);
        let value = if calldata.len() >= 36
            && calldata.starts_with(&IERC4626::convertToAssetsCall::SELECTOR)
        {
            U256::from_be_slice(&calldata[4..36]) * rate / wad()
        } else if calldata.starts_with(&IMToken::exchangeRateStoredCall::SELECTOR) {
            rate
        } else {
            return Err(Error::Chain(format!("unsupported call to {}", to)));
        };
        Ok(Bytes::from(value.to_be_bytes::<32>().to_vec()))
    }
}

pub(crate) struct ScriptedPriceSource {
    name: &'static str,
    price: f64,
    failing: AtomicBool,
    only: Option<Address>,
    calls: AtomicUsize,
}

impl ScriptedPriceSource {
    pub fn fixed(name: &'static str, price: f64) -> Self {
        Self {
            name,
            price,
            failing: AtomicBool::new(false),
            only: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: &'static str) -> Self {
        let source = Self::fixed(name, 0.0);
        source.set_failing(true);
        source
    }

    pub fn only_for(mut self, token: Address) -> Self {
        self.only = Some(token);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceSource for ScriptedPriceSource {
    fn name(&self) -> &'static str {
        self.name
    }

    fn supports(&self, token: Address) -> bool {
        self.only.map_or(true, |only| only == token)
    }

    async fn fetch(&self, _token: Address, symbol: &str) -> Result<SourcePrice> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Network(format!("{} has no price for {}", self.name, symbol)));
        }
        Ok(SourcePrice {
            price: self.price,
            change_24h: None,
        })
    }
}

/// Quotes a fixed output amount with an executable payload
pub(crate) struct StubQuoteProvider {
    amount_out: U256,
    price_impact: f64,
    failure: Mutex<Option<Error>>,
    calls: AtomicUsize,
}

impl StubQuoteProvider {
    pub fn returning_out(amount_out: U256) -> Self {
        Self {
            amount_out,
            price_impact: 0.1,
            failure: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_price_impact(mut self, percent: f64) -> Self {
        self.price_impact = percent;
        self
    }

    /// Fail the next quote with `error`
    pub fn fail_next(&self, error: Error) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QuoteProvider for StubQuoteProvider {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn quote(&self, request: &QuoteRequest) -> Result<Quote> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failure.lock().unwrap().take() {
            return Err(error);
        }
        Ok(Quote {
            provider: ProviderKind::Aggregator,
            token_in: request.token_in,
            token_out: request.token_out,
            amount_in: request.amount_in,
            amount_out: self.amount_out,
            price_impact_percent: self.price_impact,
            gas_estimate: Some(180_000),
            transaction: Some(QuoteTransaction {
                to: STUB_ROUTER,
                data: Bytes::from(vec![0x83, 0xbd, 0x37, 0xf9]),
                value: U256::ZERO,
                gas: Some(180_000),
                gas_price: None,
            }),
        })
    }
}

type AfterSubmit = Box<dyn FnOnce(&FakeChain) + Send>;

/// Records submitted batches and applies ERC20 and native transfers to the
/// fake chain, the way a confirmed bundle would
pub(crate) struct MockSubmitter {
    chain: Arc<FakeChain>,
    submissions: Mutex<Vec<Vec<PreparedCall>>>,
    failure: Mutex<Option<Error>>,
    after: Mutex<Option<AfterSubmit>>,
    nonce: AtomicU64,
}

impl MockSubmitter {
    pub fn new(chain: Arc<FakeChain>) -> Self {
        Self {
            chain,
            submissions: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            after: Mutex::new(None),
            nonce: AtomicU64::new(0),
        }
    }

    /// Fail the next submission after it reaches the chain
    pub fn fail_next(&self, error: Error) {
        *self.failure.lock().unwrap() = Some(error);
    }

    /// Mutate chain state once, right after the next successful submission
    pub fn after_next(&self, effect: impl FnOnce(&FakeChain) + Send + 'static) {
        *self.after.lock().unwrap() = Some(Box::new(effect));
    }

    pub fn submissions(&self) -> Vec<Vec<PreparedCall>> {
        self.submissions.lock().unwrap().clone()
    }

    fn apply(&self, from: Address, call: &PreparedCall) {
        let data = call.data.as_ref();
        if data.len() == 68 && data[..4] == ERC20_TRANSFER {
            let to = Address::from_slice(&data[16..36]);
            let amount = U256::from_be_slice(&data[36..68]);
            self.chain.move_erc20(call.to, from, to, amount);
        } else if data.is_empty() && !call.value.is_zero() {
            self.chain.move_native(from, call.to, call.value);
        }
    }
}

#[async_trait]
impl TransactionSubmitter for MockSubmitter {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn submit(&self, wallet: &WalletRecord, calls: &[PreparedCall]) -> Result<SubmissionReceipt> {
        self.submissions.lock().unwrap().push(calls.to_vec());
        if let Some(error) = self.failure.lock().unwrap().take() {
            return Err(error);
        }

        for call in calls {
            self.apply(wallet.address, call);
        }
        if let Some(effect) = self.after.lock().unwrap().take() {
            effect(&self.chain);
        }

        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SubmissionReceipt {
            tx_hash: format!("0x{:064x}", nonce),
            gas_used: Some(21_000 * calls.len() as u64),
        })
    }
}

/// Fully wired components over an in-memory database and fake chain
pub(crate) struct Harness {
    pub db: Database,
    pub chain: Arc<FakeChain>,
    pub keystore: Arc<EncryptedKeyStore>,
    pub reconciler: Arc<PositionReconciler>,
    pub direct: Arc<MockSubmitter>,
    pub gasless: Arc<MockSubmitter>,
    pub monitor: DepositMonitor,
    pub executor: TransactionExecutor,
    pub gate: ExportSafetyGate,
}

impl Harness {
    pub async fn new() -> Self {
        let db = Database::in_memory().await.unwrap();
        let chain = Arc::new(FakeChain::new());
        let keystore = Arc::new(
            EncryptedKeyStore::new(
                db.clone(),
                &SecretString::from("harness master key 0123456789".to_string()),
            )
            .unwrap(),
        );

        let policy = SafetyPolicy::default();
        let prices = Arc::new(PriceOracleCache::new(
            vec![Arc::new(ScriptedPriceSource::fixed("market_data", 3000.0))],
            Duration::from_secs(60),
        ));
        let balances = Arc::new(BalanceAggregator::new(
            chain.clone(),
            prices,
            ProtocolKind::ALL.to_vec(),
            &policy,
            Duration::ZERO,
        ));
        let reconciler = Arc::new(PositionReconciler::new(db.clone(), balances.clone(), &policy));

        // 30 USDC out for any swap
        let quotes = Arc::new(StubQuoteProvider::returning_out(U256::from(30_000_000u64)));
        let router = Arc::new(QuoteRouter::new(quotes.clone(), quotes, &QuoteConfig::default()));

        let direct = Arc::new(MockSubmitter::new(chain.clone()));
        let gasless = Arc::new(MockSubmitter::new(chain.clone()));
        let submitters = Submitters {
            direct: direct.clone(),
            gasless: gasless.clone(),
        };
        let monitor = DepositMonitor::new();

        let executor = TransactionExecutor::new(
            db.clone(),
            keystore.clone(),
            balances.clone(),
            router,
            submitters,
            monitor.clone(),
            ExecutionConfig::default(),
            8453,
        );
        let gate = ExportSafetyGate::new(
            db.clone(),
            keystore.clone(),
            balances.clone(),
            reconciler.clone(),
            gasless.clone(),
            &policy,
        );

        Self {
            db,
            chain,
            keystore,
            reconciler,
            direct,
            gasless,
            monitor,
            executor,
            gate,
        }
    }

    /// Gasless-provisioned wallet with a fresh owner key
    pub async fn delegated_user(&self, user_id: i64) -> WalletRecord {
        let (_, owner_secret) = SecureWallet::generate();
        let funds = Address::repeat_byte(0x50 + user_id as u8);
        self.keystore
            .store_delegated(user_id, &owner_secret, funds)
            .await
            .unwrap()
    }

    pub async fn direct_user(&self, user_id: i64) -> WalletRecord {
        self.keystore.create_direct(user_id).await.unwrap()
    }

    pub async fn open_position(&self, user_id: i64, protocol: ProtocolKind, amount: f64) -> PositionRecord {
        let position = PositionRecord::opened(
            user_id,
            protocol,
            &format!("{}-usdc", protocol.name()),
            amount,
            5.0,
            &format!("0x{}", uuid::Uuid::new_v4().simple()),
        );
        self.db.insert_position(&position).await.unwrap();
        position
    }

    pub fn receipt(&self, protocol: ProtocolKind) -> Address {
        protocol.adapter().receipt_token()
    }
}
