/// Payout currency when a country is unknown or unmapped
pub const DEFAULT_CURRENCY: &str = "USD";

/// Fiat currency an organization is paid in, by registered country
pub fn currency_for_country(country: &str) -> &'static str {
    match country.trim() {
        "Kenya" => "KES",
        "Nigeria" => "NGN",
        "Ghana" => "GHS",
        "South Africa" => "ZAR",
        "Uganda" => "UGX",
        "Tanzania" => "TZS",
        "UK" => "GBP",
        "US" | "USA" => "USD",
        "Switzerland" => "CHF",
        "France" => "EUR",
        "Global" | "International" => "USD",
        _ => DEFAULT_CURRENCY,
    }
}
