//! SeaORM entity models
//!
//! Database entities for the review lifecycle engine

mod assignment;
mod author_campaign;
mod credit_ledger_entry;
mod issue;
mod ledger_entry;
mod monitoring_record;
mod reader_account;
mod review;

pub use assignment::{
    Entity as AssignmentEntity,
    Model as Assignment,
    ActiveModel as AssignmentActiveModel,
    Column as AssignmentColumn,
    AssignmentStatus,
    BookFormat,
};

pub use author_campaign::{
    Entity as AuthorCampaignEntity,
    Model as AuthorCampaign,
    ActiveModel as AuthorCampaignActiveModel,
    Column as AuthorCampaignColumn,
};

pub use credit_ledger_entry::{
    Entity as CreditLedgerEntryEntity,
    Model as CreditLedgerEntry,
    ActiveModel as CreditLedgerEntryActiveModel,
    Column as CreditLedgerEntryColumn,
};

pub use issue::{
    Entity as IssueEntity,
    Model as Issue,
    ActiveModel as IssueActiveModel,
    Column as IssueColumn,
    IssueSeverity,
    IssueStatus,
    IssueType,
};

pub use ledger_entry::{
    Entity as LedgerEntryEntity,
    Model as LedgerEntry,
    ActiveModel as LedgerEntryActiveModel,
    Column as LedgerEntryColumn,
    LedgerEntryKind,
};

pub use monitoring_record::{
    Entity as MonitoringRecordEntity,
    Model as MonitoringRecord,
    ActiveModel as MonitoringRecordActiveModel,
    Column as MonitoringRecordColumn,
};

pub use reader_account::{
    Entity as ReaderAccountEntity,
    Model as ReaderAccount,
    ActiveModel as ReaderAccountActiveModel,
    Column as ReaderAccountColumn,
};

pub use review::{
    Entity as ReviewEntity,
    Model as Review,
    ActiveModel as ReviewActiveModel,
    Column as ReviewColumn,
    ReviewStatus,
};
