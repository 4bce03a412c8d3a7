pub mod hedging;
pub mod pnl;
