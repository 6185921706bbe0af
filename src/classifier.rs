use crate::session::Exchange;

/// Returns true when the exchange looks TLS-secured.
///
/// The host flag alone misses sessions such as `https://host:433/`, where TLS
/// runs on a non-standard port, so the scheme and an explicit `:443` in the
/// URL are checked as well.
pub fn is_secure<E: Exchange + ?Sized>(exchange: &E) -> bool {
    let url = exchange.full_url();
    let host_flag = exchange.is_https();
    let https_scheme = url.starts_with("https:");
    let port_443 = url.contains(":443");
    host_flag | https_scheme | port_443
}
