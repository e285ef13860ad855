/// ETL Pipeline Module
///
/// The per-item stages the pipeline is built from:
/// - Extract: Fetch blocks and account detail from the ledger node
/// - Transform: Decode raw payloads into typed records and detect new accounts
/// - Load: Write records into the operational store and the graph store
pub mod extract;
pub mod load;
pub mod parsers;
pub mod transform;
