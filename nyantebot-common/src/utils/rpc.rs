use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use cached::proc_macro::cached;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};

use super::requests::get_reqwest_client;

/// A BSC account address. Parsing accepts `0x`-prefixed 40-digit hex and
/// rejects mixed-case input with a wrong EIP-55 checksum; `Display` always
/// renders the checksummed form.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn checksummed(&self) -> String {
        let lower = hex::encode(self.0);
        let digest = Keccak256::digest(lower.as_bytes());
        let mut out = String::with_capacity(42);
        out.push_str("0x");
        for (i, c) in lower.chars().enumerate() {
            let nibble = if i % 2 == 0 {
                digest[i / 2] >> 4
            } else {
                digest[i / 2] & 0x0f
            };
            if nibble >= 8 {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push(c);
            }
        }
        out
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.checksummed())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.checksummed())
    }
}

impl FromStr for Address {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_part = s
            .strip_prefix("0x")
            .ok_or_else(|| anyhow::anyhow!("Address must start with 0x"))?;
        if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(anyhow::anyhow!("Address must be 40 hex digits"));
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(hex_part.to_lowercase(), &mut bytes)?;
        let address = Address(bytes);
        // All-lowercase and all-uppercase input carries no checksum
        let has_lower = hex_part.chars().any(|c| c.is_ascii_lowercase());
        let has_upper = hex_part.chars().any(|c| c.is_ascii_uppercase());
        if has_lower && has_upper && address.checksummed() != format!("0x{hex_part}") {
            return Err(anyhow::anyhow!("Address checksum mismatch"));
        }
        Ok(address)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.checksummed())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

pub fn is_valid_address(s: &str) -> bool {
    s.parse::<Address>().is_ok()
}

fn selector(signature: &str) -> [u8; 4] {
    let digest = Keccak256::digest(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

fn push_word_u128(out: &mut Vec<u8>, value: u128) {
    out.extend_from_slice(&[0u8; 16]);
    out.extend_from_slice(&value.to_be_bytes());
}

fn push_word_address(out: &mut Vec<u8>, address: Address) {
    out.extend_from_slice(&[0u8; 12]);
    out.extend_from_slice(&address.0);
}

pub fn balance_of_calldata(owner: Address) -> Vec<u8> {
    let mut out = selector("balanceOf(address)").to_vec();
    push_word_address(&mut out, owner);
    out
}

/// ABI-encodes either a plain `transfer` or a `multiTransfer` batch,
/// whichever the recipient count calls for.
pub fn transfer_calldata(transfers: &[(Address, u128)]) -> Vec<u8> {
    if let [(to, amount)] = transfers {
        let mut out = selector("transfer(address,uint256)").to_vec();
        push_word_address(&mut out, *to);
        push_word_u128(&mut out, *amount);
        return out;
    }
    let n = transfers.len() as u128;
    let mut out = selector("multiTransfer(address[],uint256[])").to_vec();
    // Two dynamic arrays: head holds their offsets from the start of the args
    push_word_u128(&mut out, 0x40);
    push_word_u128(&mut out, 0x40 + 32 + 32 * n);
    push_word_u128(&mut out, n);
    for (to, _) in transfers {
        push_word_address(&mut out, *to);
    }
    push_word_u128(&mut out, n);
    for (_, amount) in transfers {
        push_word_u128(&mut out, *amount);
    }
    out
}

pub fn to_quantity(value: u128) -> String {
    format!("0x{value:x}")
}

pub fn parse_quantity(s: &str) -> Result<u128, anyhow::Error> {
    let hex_part = s
        .strip_prefix("0x")
        .ok_or_else(|| anyhow::anyhow!("Quantity must start with 0x: {s}"))?;
    if hex_part.len() > 32 {
        let (high, low) = hex_part.split_at(hex_part.len() - 32);
        if high.chars().any(|c| c != '0') {
            return Err(anyhow::anyhow!("Quantity does not fit into u128: {s}"));
        }
        return Ok(u128::from_str_radix(low, 16)?);
    }
    Ok(u128::from_str_radix(hex_part, 16)?)
}

async fn rpc_call(
    rpc_url: &str,
    method: &str,
    params: serde_json::Value,
) -> Result<serde_json::Value, anyhow::Error> {
    let response: serde_json::Value = get_reqwest_client()
        .post(rpc_url)
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        }))
        .send()
        .await?
        .json()
        .await?;
    if let Some(error) = response.get("error") {
        return Err(anyhow::anyhow!("RPC error from {method}: {error}"));
    }
    response
        .get("result")
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("RPC response from {method} has no result"))
}

fn result_as_str(result: &serde_json::Value, method: &str) -> Result<String, anyhow::Error> {
    result
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Unexpected {method} result: {result}"))
}

#[cached(time = 30, result = true, size = 1)]
async fn gas_price_cached_30s(rpc_url: String) -> Result<u128, anyhow::Error> {
    let result = rpc_call(&rpc_url, "eth_gasPrice", serde_json::json!([])).await?;
    parse_quantity(&result_as_str(&result, "eth_gasPrice")?)
}

/// The chain-side collaborator. Every call goes over the network, can fail,
/// and can be slow; callers must not hold ledger locks across these.
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    /// Estimated total BNB fee in wei for sending this batch of token
    /// transfers from the hot wallet.
    async fn estimate_fee(&self, transfers: &[(Address, u128)]) -> Result<u128, anyhow::Error>;

    /// Submits the batch as a single transaction and returns the tx hash.
    async fn submit(&self, transfers: &[(Address, u128)]) -> Result<String, anyhow::Error>;

    async fn token_balance(&self, address: Address) -> Result<u128, anyhow::Error>;

    async fn bnb_balance(&self, address: Address) -> Result<u128, anyhow::Error>;

    /// Creates a fresh custodial deposit account in the node keystore.
    async fn new_deposit_account(&self) -> Result<Address, anyhow::Error>;
}

/// `ChainClient` talking JSON-RPC to a BSC node that holds the custodial
/// keys (geth `personal` namespace).
pub struct BscRpc {
    rpc_url: String,
    token_contract: Address,
    hot_wallet: Address,
    wallet_passphrase: String,
}

impl BscRpc {
    pub fn new(
        rpc_url: String,
        token_contract: Address,
        hot_wallet: Address,
        wallet_passphrase: String,
    ) -> Self {
        Self {
            rpc_url,
            token_contract,
            hot_wallet,
            wallet_passphrase,
        }
    }

    pub fn from_env() -> Result<Self, anyhow::Error> {
        let rpc_url = std::env::var("BSC_RPC_URL")
            .unwrap_or_else(|_| "https://bsc-dataseed1.binance.org/".to_string());
        let token_contract = std::env::var("TOKEN_CONTRACT")
            .map_err(|_| anyhow::anyhow!("TOKEN_CONTRACT not set"))?
            .parse()?;
        let hot_wallet = std::env::var("HOT_WALLET")
            .map_err(|_| anyhow::anyhow!("HOT_WALLET not set"))?
            .parse()?;
        let wallet_passphrase = std::env::var("WALLET_PASSPHRASE").unwrap_or_default();
        Ok(Self::new(
            rpc_url,
            token_contract,
            hot_wallet,
            wallet_passphrase,
        ))
    }

    pub fn hot_wallet(&self) -> Address {
        self.hot_wallet
    }

    async fn estimate_gas(&self, calldata: &[u8]) -> Result<u128, anyhow::Error> {
        let result = rpc_call(
            &self.rpc_url,
            "eth_estimateGas",
            serde_json::json!([{
                "from": self.hot_wallet,
                "to": self.token_contract,
                "data": format!("0x{}", hex::encode(calldata)),
            }]),
        )
        .await?;
        parse_quantity(&result_as_str(&result, "eth_estimateGas")?)
    }
}

#[async_trait]
impl ChainClient for BscRpc {
    async fn estimate_fee(&self, transfers: &[(Address, u128)]) -> Result<u128, anyhow::Error> {
        let gas = self.estimate_gas(&transfer_calldata(transfers)).await?;
        let gas_price = gas_price_cached_30s(self.rpc_url.clone()).await?;
        gas.checked_mul(gas_price)
            .ok_or_else(|| anyhow::anyhow!("Fee estimate overflow"))
    }

    async fn submit(&self, transfers: &[(Address, u128)]) -> Result<String, anyhow::Error> {
        let calldata = transfer_calldata(transfers);
        let gas = self.estimate_gas(&calldata).await?;
        let gas_price = gas_price_cached_30s(self.rpc_url.clone()).await?;
        let result = rpc_call(
            &self.rpc_url,
            "personal_sendTransaction",
            serde_json::json!([
                {
                    "from": self.hot_wallet,
                    "to": self.token_contract,
                    "value": "0x0",
                    "gas": to_quantity(gas),
                    "gasPrice": to_quantity(gas_price),
                    "data": format!("0x{}", hex::encode(&calldata)),
                },
                self.wallet_passphrase,
            ]),
        )
        .await?;
        result_as_str(&result, "personal_sendTransaction")
    }

    async fn token_balance(&self, address: Address) -> Result<u128, anyhow::Error> {
        let result = rpc_call(
            &self.rpc_url,
            "eth_call",
            serde_json::json!([
                {
                    "to": self.token_contract,
                    "data": format!("0x{}", hex::encode(balance_of_calldata(address))),
                },
                "latest",
            ]),
        )
        .await?;
        parse_quantity(&result_as_str(&result, "eth_call")?)
    }

    async fn bnb_balance(&self, address: Address) -> Result<u128, anyhow::Error> {
        let result = rpc_call(
            &self.rpc_url,
            "eth_getBalance",
            serde_json::json!([address, "latest"]),
        )
        .await?;
        parse_quantity(&result_as_str(&result, "eth_getBalance")?)
    }

    async fn new_deposit_account(&self) -> Result<Address, anyhow::Error> {
        let result = rpc_call(
            &self.rpc_url,
            "personal_newAccount",
            serde_json::json!([self.wallet_passphrase]),
        )
        .await?;
        result_as_str(&result, "personal_newAccount")?.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksums_match_eip55_vectors() {
        for vector in [
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
            "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359",
            "0xdbF03B407c01E7cD3CBea99509d93f8DDDC8C6FB",
            "0xD1220A0cf47c7B9Be7A2E6BA89F429762e7b9aDb",
        ] {
            let address: Address = vector.to_lowercase().parse().unwrap();
            assert_eq!(address.checksummed(), vector);
        }
    }

    #[test]
    fn accepts_unchecksummed_and_rejects_bad_checksums() {
        assert!(is_valid_address("0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed"));
        assert!(is_valid_address("0x5AAEB6053F3E94C9B9A09F33669435E7EF1BEAED"));
        assert!(is_valid_address("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"));
        // Same address with two checksum characters swapped
        assert!(!is_valid_address("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1beAed"));
        assert!(!is_valid_address("0x5aaeb6053f3e94c9b9a09f33669435e7ef1beae"));
        assert!(!is_valid_address("5aaeb6053f3e94c9b9a09f33669435e7ef1beaed"));
    }

    #[test]
    fn transfer_selector_is_the_known_constant() {
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(selector("balanceOf(address)"), [0x70, 0xa0, 0x82, 0x31]);
    }

    #[test]
    fn single_transfer_calldata_layout() {
        let to: Address = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".parse().unwrap();
        let calldata = transfer_calldata(&[(to, 1_000_000)]);
        assert_eq!(calldata.len(), 4 + 32 + 32);
        assert_eq!(&calldata[..4], &[0xa9, 0x05, 0x9c, 0xbb][..]);
        assert_eq!(&calldata[16..36], &to.0[..]);
        assert_eq!(&calldata[36..52], &[0u8; 16][..]);
        assert_eq!(&calldata[52..68], &1_000_000u128.to_be_bytes()[..]);
    }

    #[test]
    fn multi_transfer_calldata_layout() {
        let a: Address = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".parse().unwrap();
        let b: Address = "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359".parse().unwrap();
        let calldata = transfer_calldata(&[(a, 7), (b, 11)]);
        // selector + 2 offsets + (len + 2 addresses) + (len + 2 amounts)
        assert_eq!(calldata.len(), 4 + 32 * 8);
        let word = |i: usize| &calldata[4 + 32 * i..4 + 32 * (i + 1)];
        assert_eq!(word(0)[31], 0x40);
        assert_eq!(word(1)[31], 0x40 + 32 + 64);
        assert_eq!(word(2)[31], 2);
        assert_eq!(&word(3)[12..], &a.0[..]);
        assert_eq!(&word(4)[12..], &b.0[..]);
        assert_eq!(word(5)[31], 2);
        assert_eq!(word(6)[31], 7);
        assert_eq!(word(7)[31], 11);
    }

    #[test]
    fn quantities_round_trip() {
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_quantity("0x10").unwrap(), 16);
        assert_eq!(parse_quantity(&to_quantity(u128::MAX)).unwrap(), u128::MAX);
        // A 32-byte word with leading zeros, as eth_call returns
        assert_eq!(
            parse_quantity(
                "0x00000000000000000000000000000000000000000000000000000000000f4240"
            )
            .unwrap(),
            1_000_000
        );
        assert!(parse_quantity(
            "0x0000000000000001000000000000000000000000000000000000000000000000"
        )
        .is_err());
    }
}
