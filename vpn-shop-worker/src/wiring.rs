//! Builds the payment service from configuration.

use std::sync::Arc;

use tracing::{info, warn};
use vpn_shop_core::{
    Result,
    config::{ShopConfig, resolve_env},
    panel::PanelClient,
    payment::{CardGatewayClient, CryptoPayClient, PaymentService, StarsClient},
    purchase::PurchaseStore,
    tax::TaxClient,
};

/// Resolves secrets and registers every enabled provider.
pub async fn build_service(
    config: &ShopConfig,
    store: Arc<dyn PurchaseStore>,
) -> Result<PaymentService> {
    let panel =
        PanelClient::new(&config.panel.url, &resolve_env(&config.panel.token_env)?, &config.http)?;
    let mut service = PaymentService::new(
        store,
        Arc::new(panel),
        config.plans.clone(),
        config.completion_settings(),
    );

    if let Some(crypto) = config.providers.crypto.as_ref().filter(|c| c.enabled) {
        let token = resolve_env(&crypto.token_env)?;
        let client = CryptoPayClient::new(&crypto.url, &token, &config.http)?;
        service = service.with_provider(Arc::new(client));
        info!("crypto provider enabled");
    }
    if let Some(card) = config.providers.card.as_ref().filter(|c| c.enabled) {
        let client = CardGatewayClient::new(
            &card.url,
            &resolve_env(&card.shop_id_env)?,
            &resolve_env(&card.secret_key_env)?,
            &card.return_url,
            &config.http,
        )?;
        service = service.with_provider(Arc::new(client));
        info!("card provider enabled");
    }
    if let Some(stars) = config.providers.stars.as_ref().filter(|s| s.enabled) {
        let token = resolve_env(&stars.bot_token_env)?;
        let client = StarsClient::new(&stars.url, &token, &config.http)?;
        service = service.with_provider(Arc::new(client));
        info!("stars provider enabled");
    }

    if let Some(tax) = &config.tax {
        let username = resolve_env(&tax.username_env)?;
        let password = resolve_env(&tax.password_env)?;
        let client = match TaxClient::connect(&tax.url, &username, &password, &config.http).await {
            Ok(client) => client,
            Err(e) => {
                // Login is retried lazily on the first report.
                warn!(error = %e, "tax service login failed at startup");
                TaxClient::new(&tax.url, &username, &password, &config.http)?
            }
        };
        service = service.with_income_reporter(Arc::new(client));
        info!("income reporting enabled");
    }

    Ok(service)
}
