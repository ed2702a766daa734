//! Premium module - Token-balance gating for premium alerts

pub mod gate;
pub mod oracle;

pub use gate::{PremiumAccessResult, PremiumGate};
pub use oracle::{BalanceOracle, BalanceProvider, RawBalance, RpcBalanceProvider};
