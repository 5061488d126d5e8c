/// Per-request metadata supplied by the directory service alongside an inbound
/// request. Threaded through dispatch so handlers and pre-processors can see who
/// is calling and which operation definition applies.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    /// Directory name of the operation definition. Used as the cache key for
    /// interface-description lookups.
    pub method_dn: Option<String>,
    /// Interface description (WSDL) text of the operation, if published.
    pub interface: Option<String>,
    /// Implementation payload of the operation definition.
    pub implementation: Option<String>,
    /// Directory name of the calling user.
    pub user_dn: Option<String>,
    /// Directory name of the calling organization.
    pub organization_dn: Option<String>,
}
