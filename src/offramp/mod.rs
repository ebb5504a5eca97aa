// Off-ramp adapters: wei in, fiat out
pub mod http;
pub mod mock;
pub mod traits;

#[cfg(test)]
pub mod testing;

use alloy_primitives::U256;
use rust_decimal::Decimal;

use crate::error::OfframpError;

pub use self::http::HttpOfframpAdapter;
pub use mock::MockOfframpAdapter;
pub use traits::{OfframpAdapter, OfframpQuote, SettlementResult};

/// 18-decimal native token
const WEI_DECIMALS: u32 = 18;

/// Convert wei into whole native tokens without going through floats
pub fn wei_to_native(amount_wei: U256) -> Result<Decimal, OfframpError> {
    let unit = U256::from(10u64).pow(U256::from(WEI_DECIMALS));
    let (whole, frac) = amount_wei.div_rem(unit);

    let out_of_range = || OfframpError::InvalidAmount(amount_wei.to_string());

    let whole = i128::try_from(whole).map_err(|_| out_of_range())?;
    let frac = i128::try_from(frac).map_err(|_| out_of_range())?;

    let whole = Decimal::try_from_i128_with_scale(whole, 0).map_err(|_| out_of_range())?;
    let frac = Decimal::try_from_i128_with_scale(frac, WEI_DECIMALS).map_err(|_| out_of_range())?;

    whole
        .checked_add(frac)
        .map(|d| d.normalize())
        .ok_or_else(out_of_range)
}
