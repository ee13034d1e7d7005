use lib_common::retrieve::BitcoinPrice;
use lib_common::{Consumer, ConsumerError, Delivery};

/// Logs the configured currencies of every price document it receives.
pub struct PriceLogger {
    currencies: Vec<String>,
}

impl PriceLogger {
    pub fn new(currencies: Vec<String>) -> Self {
        Self { currencies }
    }

    fn describe(&self, price: &BitcoinPrice) -> String {
        let rates: Vec<String> = self
            .currencies
            .iter()
            .map(|code| match price.rate(code) {
                Some(rate) => format!("{} {:.4}", code, rate),
                None => format!("{} n/a", code),
            })
            .collect();
        format!("{} @ {}: {}", price.chart_name, price.time.updated, rates.join(", "))
    }
}

impl Consumer for PriceLogger {
    fn deliver(&self, delivery: &Delivery) -> Result<(), ConsumerError> {
        let price = BitcoinPrice::parse(delivery.payload.as_bytes())
            .map_err(|e| ConsumerError::new(format!("not a price document: {}", e)))?;
        log::info!("[{:?}] {}", delivery.origin, self.describe(&price));
        Ok(())
    }
}
