//! Core types for the ledger
//!
//! All stored types are designed for:
//! - Deterministic serialization (bincode rows, camelCase JSON at the boundary)
//! - Integer token arithmetic (no fractional jetons)
//! - Exact decimals for fiat amounts and prize values

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw id
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            /// Raw id value
            pub const fn get(&self) -> u64 {
                self.0
            }

            /// Big-endian key bytes (keeps RocksDB iteration in creation order)
            pub fn to_key(&self) -> [u8; 8] {
                self.0.to_be_bytes()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(
    /// Account identifier (user, parent or child)
    AccountId
);
entity_id!(
    /// Vendor stand identifier
    StandId
);
entity_id!(
    /// Stock line identifier
    StockLineId
);
entity_id!(
    /// Ledger transaction record identifier
    TransactionId
);
entity_id!(
    /// Tombola identifier
    TombolaId
);
entity_id!(
    /// Raffle ticket identifier
    TicketId
);
entity_id!(
    /// Prize (lot) identifier
    PrizeId
);
entity_id!(
    /// Winner record identifier
    WinnerId
);

/// Kind of account holding a balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountKind {
    /// Plain user (organiser, stand holder, ...)
    User,
    /// Parent, may fund linked children
    Parent,
    /// Child (eleve), linked to at most one parent
    Child,
}

impl AccountKind {
    /// Stable code
    pub fn code(&self) -> &'static str {
        match self {
            AccountKind::User => "USER",
            AccountKind::Parent => "PARENT",
            AccountKind::Child => "CHILD",
        }
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Token account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Account id
    pub id: AccountId,

    /// Display name
    pub name: String,

    /// Current token balance (never negative)
    pub balance_tokens: i64,

    /// Balance at creation, the baseline of the conservation law
    pub opening_balance: i64,

    /// Loyalty points earned at activity stands
    pub accumulated_points: i64,

    /// Account kind tag
    pub kind: AccountKind,

    /// Parent of a child account
    pub parent: Option<AccountId>,

    /// Children of a parent account, in link order
    pub children: Vec<AccountId>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Whether `child` is linked to this account
    pub fn has_child(&self, child: AccountId) -> bool {
        self.children.contains(&child)
    }
}

/// Stand category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StandCategory {
    /// Food stand
    Food,
    /// Drink stand
    Drink,
    /// Activity stand (awards loyalty points)
    Activity,
}

impl StandCategory {
    /// Stable code
    pub fn code(&self) -> &'static str {
        match self {
            StandCategory::Food => "FOOD",
            StandCategory::Drink => "DRINK",
            StandCategory::Activity => "ACTIVITY",
        }
    }

    /// Whether purchases award loyalty points
    pub fn awards_points(&self) -> bool {
        matches!(self, StandCategory::Activity)
    }
}

impl fmt::Display for StandCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Vendor stand
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stand {
    /// Stand id
    pub id: StandId,

    /// Display name
    pub name: String,

    /// Category
    pub category: StandCategory,

    /// Tokens received from purchases (monotonic)
    pub tokens_collected: i64,

    /// Loyalty points handed out by this stand
    pub points_awarded: i64,

    /// Stock lines, first line is the default purchase target
    pub stock_lines: Vec<StockLineId>,
}

/// One product line of a stand's stock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockLine {
    /// Line id
    pub id: StockLineId,

    /// Owning stand
    pub stand_id: StandId,

    /// Product name
    pub product_name: String,

    /// Units left (never negative)
    pub quantity: i64,

    /// Unit price in tokens
    pub price_tokens: i64,
}

/// Transaction record kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Token purchase (minting) or purchase at a stand
    Purchase,
    /// Token usage
    Utilisation,
    /// Parent to child transfer
    Transfer,
    /// Payment entry
    Payment,
}

impl TransactionKind {
    /// All kinds, in summary order
    pub const ALL: [TransactionKind; 4] = [
        TransactionKind::Purchase,
        TransactionKind::Utilisation,
        TransactionKind::Transfer,
        TransactionKind::Payment,
    ];

    /// Stable code
    pub fn code(&self) -> &'static str {
        match self {
            TransactionKind::Purchase => "PURCHASE",
            TransactionKind::Utilisation => "UTILISATION",
            TransactionKind::Transfer => "TRANSFER",
            TransactionKind::Payment => "PAYMENT",
        }
    }

    /// Parse from stable code
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "PURCHASE" => Some(TransactionKind::Purchase),
            "UTILISATION" => Some(TransactionKind::Utilisation),
            "TRANSFER" => Some(TransactionKind::Transfer),
            "PAYMENT" => Some(TransactionKind::Payment),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Append-only ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    /// Record id (creation order)
    pub id: TransactionId,

    /// Account the amount is booked on
    pub account_id: AccountId,

    /// Account on the other side of a transfer, credited with `-amount`
    pub counterparty_account_id: Option<AccountId>,

    /// Signed amount, negative = debit of `account_id`
    pub amount: i64,

    /// Kind
    pub kind: TransactionKind,

    /// Human readable description
    pub description: String,

    /// Stand the purchase was made at
    pub stand_id: Option<StandId>,

    /// Tombola the ticket was bought for
    pub tombola_id: Option<TombolaId>,

    /// External payment reference (token minting)
    pub payment_ref: Option<String>,

    /// Fiat amount paid for minted tokens
    pub fiat_amount: Option<Decimal>,

    /// False for record-only manual entries that did not touch a balance
    pub applied: bool,

    /// Administrative entry, not produced by a purchase, transfer or payment
    pub manual: bool,

    /// Creation timestamp
    pub timestamp: DateTime<Utc>,
}

impl TransactionRecord {
    /// Net effect of this record on `account`'s balance
    pub fn effect_on(&self, account: AccountId) -> i64 {
        if !self.applied {
            return 0;
        }
        let mut effect = 0;
        if self.account_id == account {
            effect += self.amount;
        }
        if self.counterparty_account_id == Some(account) {
            effect -= self.amount;
        }
        effect
    }
}

/// Record fields supplied by the engine; id and timestamp are assigned on append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    /// Account the amount is booked on
    pub account_id: AccountId,
    /// Transfer counterparty
    pub counterparty_account_id: Option<AccountId>,
    /// Signed amount
    pub amount: i64,
    /// Kind
    pub kind: TransactionKind,
    /// Description
    pub description: String,
    /// Stand reference
    pub stand_id: Option<StandId>,
    /// Tombola reference
    pub tombola_id: Option<TombolaId>,
    /// Payment reference
    pub payment_ref: Option<String>,
    /// Fiat amount
    pub fiat_amount: Option<Decimal>,
    /// Whether the amount was applied to a balance
    pub applied: bool,
    /// Administrative entry
    pub manual: bool,
}

impl NewTransaction {
    /// Applied record of `kind` booked on `account_id`
    pub fn new(
        account_id: AccountId,
        amount: i64,
        kind: TransactionKind,
        description: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            counterparty_account_id: None,
            amount,
            kind,
            description: description.into(),
            stand_id: None,
            tombola_id: None,
            payment_ref: None,
            fiat_amount: None,
            applied: true,
            manual: false,
        }
    }
}

/// Token purchase awaiting its payment confirmation
///
/// Stored under its payment reference until the confirmation credits or
/// cancels it, or until it expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenOrder {
    /// Account to credit
    pub account_id: AccountId,

    /// Amount charged
    pub fiat_amount: Decimal,

    /// Tokens to credit
    pub token_amount: i64,

    /// When the payment intent was created
    pub created_at: DateTime<Utc>,
}

/// Raffle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombola {
    /// Tombola id
    pub id: TombolaId,

    /// Kermesse (event) this tombola belongs to
    pub event_id: u64,

    /// Display name
    pub name: String,

    /// Tokens received from ticket sales
    pub tokens_collected: i64,

    /// Prizes in draw order
    pub prizes: Vec<PrizeId>,

    /// Number of draws executed
    pub draw_count: u32,
}

/// Raffle ticket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    /// Ticket id
    pub id: TicketId,

    /// Tombola
    pub tombola_id: TombolaId,

    /// Buyer
    pub owner_account_id: AccountId,

    /// Unique serial (`T-<nanos>-<digits>`)
    pub serial_number: String,

    /// Price paid in tokens
    pub price_tokens: i64,

    /// Set once when the ticket wins a prize
    pub won: bool,

    /// Purchase timestamp
    pub purchased_at: DateTime<Utc>,
}

/// Prize (lot)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prize {
    /// Prize id
    pub id: PrizeId,

    /// Tombola
    pub tombola_id: TombolaId,

    /// Name
    pub name: String,

    /// Description
    pub description: String,

    /// Declared value
    pub value: Decimal,
}

/// Winning ticket for a prize
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinnerRecord {
    /// Record id
    pub id: WinnerId,

    /// Tombola
    pub tombola_id: TombolaId,

    /// Prize won
    pub prize_id: PrizeId,

    /// Winning ticket
    pub ticket_id: TicketId,

    /// Ticket owner at draw time
    pub owner_account_id: AccountId,

    /// Draw timestamp
    pub drawn_at: DateTime<Utc>,
}
