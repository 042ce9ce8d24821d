//! Canonical entity and citation type enumerations.
//!
//! Every type a pattern file or an LLM response can declare is funnelled
//! through [`AliasMap::canonicalize`] at load/parse time. The closed enums
//! below are the only type values that survive past that point; unknown
//! names fall back to [`EntityType::LegalConcept`] and are tagged in
//! provenance so downstream consumers can tell.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

/// Declares a closed string-backed enum with `as_str`/`parse` and serde
/// impls that round-trip through the canonical string form.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $value:literal,)+ }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $value,)+
                }
            }

            /// Parse an exact canonical name. Aliases go through [`AliasMap`].
            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($value => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                $name::parse(&raw).ok_or_else(|| {
                    serde::de::Error::custom(format!(
                        "unknown {} value: {}",
                        stringify!($name),
                        raw
                    ))
                })
            }
        }
    };
}

string_enum! {
    /// Canonical non-citation entity types.
    EntityType {
        // Judicial roles and legal professionals
        Court => "COURT",
        Judge => "JUDGE",
        Justice => "JUSTICE",
        Magistrate => "MAGISTRATE",
        Attorney => "ATTORNEY",
        Prosecutor => "PROSECUTOR",
        PublicDefender => "PUBLIC_DEFENDER",
        LawFirm => "LAW_FIRM",
        LawClerk => "LAW_CLERK",
        CourtReporter => "COURT_REPORTER",
        Mediator => "MEDIATOR",
        Arbitrator => "ARBITRATOR",
        ExpertWitness => "EXPERT_WITNESS",
        Witness => "WITNESS",
        Juror => "JUROR",
        Jury => "JURY",

        // Parties
        Party => "PARTY",
        Plaintiff => "PLAINTIFF",
        Defendant => "DEFENDANT",
        Appellant => "APPELLANT",
        Appellee => "APPELLEE",
        Petitioner => "PETITIONER",
        Respondent => "RESPONDENT",
        Intervenor => "INTERVENOR",
        AmicusCuriae => "AMICUS_CURIAE",
        ThirdParty => "THIRD_PARTY",
        Guardian => "GUARDIAN",
        Trustee => "TRUSTEE",
        Executor => "EXECUTOR",
        Beneficiary => "BENEFICIARY",
        ClassRepresentative => "CLASS_REPRESENTATIVE",

        // Persons and organizations
        Person => "PERSON",
        Organization => "ORGANIZATION",
        Corporation => "CORPORATION",
        Partnership => "PARTNERSHIP",
        GovernmentEntity => "GOVERNMENT_ENTITY",
        GovernmentAgency => "GOVERNMENT_AGENCY",
        Nonprofit => "NONPROFIT",
        Insurer => "INSURER",
        Bank => "BANK",
        Employer => "EMPLOYER",
        Employee => "EMPLOYEE",

        // Documents and filings
        Document => "DOCUMENT",
        Motion => "MOTION",
        Brief => "BRIEF",
        Order => "ORDER",
        Judgment => "JUDGMENT",
        Opinion => "OPINION",
        Complaint => "COMPLAINT",
        Answer => "ANSWER",
        Petition => "PETITION",
        Subpoena => "SUBPOENA",
        Summons => "SUMMONS",
        Warrant => "WARRANT",
        Affidavit => "AFFIDAVIT",
        Declaration => "DECLARATION",
        Deposition => "DEPOSITION",
        Interrogatory => "INTERROGATORY",
        Exhibit => "EXHIBIT",
        Transcript => "TRANSCRIPT",
        Contract => "CONTRACT",
        Agreement => "AGREEMENT",
        Settlement => "SETTLEMENT",
        Stipulation => "STIPULATION",
        Notice => "NOTICE",
        Pleading => "PLEADING",
        Indictment => "INDICTMENT",
        JuryInstruction => "JURY_INSTRUCTION",
        Memorandum => "MEMORANDUM",
        DocketEntry => "DOCKET_ENTRY",

        // Statutes, regulations and rules (the instruments themselves, not
        // citations to them)
        Statute => "STATUTE",
        CodeSection => "CODE_SECTION",
        LegislativeAct => "LEGISLATIVE_ACT",
        Regulation => "REGULATION",
        AdministrativeCode => "ADMINISTRATIVE_CODE",
        ExecutiveOrder => "EXECUTIVE_ORDER",
        Ordinance => "ORDINANCE",
        ConstitutionalProvision => "CONSTITUTIONAL_PROVISION",
        Amendment => "AMENDMENT",
        Treaty => "TREATY",
        CourtRule => "COURT_RULE",
        LocalRule => "LOCAL_RULE",
        ProceduralRule => "PROCEDURAL_RULE",

        // Financial
        MonetaryAmount => "MONETARY_AMOUNT",
        Damages => "DAMAGES",
        Fine => "FINE",
        Penalty => "PENALTY",
        SettlementAmount => "SETTLEMENT_AMOUNT",
        AttorneyFees => "ATTORNEY_FEES",
        Costs => "COSTS",
        BondAmount => "BOND_AMOUNT",
        Lien => "LIEN",
        JudgmentAmount => "JUDGMENT_AMOUNT",
        Payment => "PAYMENT",
        InterestRate => "INTEREST_RATE",
        Tax => "TAX",
        Asset => "ASSET",

        // Temporal
        Date => "DATE",
        Time => "TIME",
        Deadline => "DEADLINE",
        FilingDate => "FILING_DATE",
        HearingDate => "HEARING_DATE",
        TrialDate => "TRIAL_DATE",
        DecisionDate => "DECISION_DATE",
        EffectiveDate => "EFFECTIVE_DATE",
        TimePeriod => "TIME_PERIOD",
        StatuteOfLimitations => "STATUTE_OF_LIMITATIONS",

        // Jurisdictional and geographic
        Jurisdiction => "JURISDICTION",
        Venue => "VENUE",
        District => "DISTRICT",
        Circuit => "CIRCUIT",
        County => "COUNTY",
        State => "STATE",
        Location => "LOCATION",
        Address => "ADDRESS",

        // Procedural concepts
        CauseOfAction => "CAUSE_OF_ACTION",
        Claim => "CLAIM",
        Defense => "DEFENSE",
        Counterclaim => "COUNTERCLAIM",
        Crossclaim => "CROSSCLAIM",
        Objection => "OBJECTION",
        Ruling => "RULING",
        StandardOfReview => "STANDARD_OF_REVIEW",
        BurdenOfProof => "BURDEN_OF_PROOF",
        Remedy => "REMEDY",
        Relief => "RELIEF",
        Injunction => "INJUNCTION",
        Appeal => "APPEAL",
        Remand => "REMAND",
        Dismissal => "DISMISSAL",
        Sanction => "SANCTION",
        DiscoveryRequest => "DISCOVERY_REQUEST",
        ProtectiveOrder => "PROTECTIVE_ORDER",

        // Legal concepts
        LegalConcept => "LEGAL_CONCEPT",
        LegalDoctrine => "LEGAL_DOCTRINE",
        Principle => "PRINCIPLE",
        LegalTheory => "LEGAL_THEORY",
        LegalTerm => "LEGAL_TERM",
        LegalStandard => "LEGAL_STANDARD",
        Procedure => "PROCEDURE",
        Precedent => "PRECEDENT",
        Holding => "HOLDING",
        Dictum => "DICTUM",

        // Intellectual property
        Patent => "PATENT",
        Trademark => "TRADEMARK",
        Copyright => "COPYRIGHT",
        TradeSecret => "TRADE_SECRET",
        License => "LICENSE",

        // Criminal and evidentiary
        Evidence => "EVIDENCE",
        Charge => "CHARGE",
        Offense => "OFFENSE",
        Sentence => "SENTENCE",
        Conviction => "CONVICTION",
        Acquittal => "ACQUITTAL",
        Plea => "PLEA",
        Parole => "PAROLE",
        Probation => "PROBATION",
        Bail => "BAIL",

        // Identifiers and contact details
        CaseNumber => "CASE_NUMBER",
        DocketNumber => "DOCKET_NUMBER",
        BarNumber => "BAR_NUMBER",
        Email => "EMAIL",
        PhoneNumber => "PHONE_NUMBER",
    }
}

string_enum! {
    /// Canonical citation types. Patterns and LLM items whose declared type
    /// resolves here produce `Citation` records instead of `Entity` records.
    CitationType {
        // Case citations
        CaseCitation => "CASE_CITATION",
        FederalCaseCitation => "FEDERAL_CASE_CITATION",
        StateCaseCitation => "STATE_CASE_CITATION",
        SupremeCourtCitation => "SUPREME_COURT_CITATION",
        AppellateCourtCitation => "APPELLATE_COURT_CITATION",
        DistrictCourtCitation => "DISTRICT_COURT_CITATION",
        BankruptcyCourtCitation => "BANKRUPTCY_COURT_CITATION",
        TaxCourtCitation => "TAX_COURT_CITATION",
        MilitaryCourtCitation => "MILITARY_COURT_CITATION",
        AdministrativeCourtCitation => "ADMINISTRATIVE_COURT_CITATION",
        InternationalCourtCitation => "INTERNATIONAL_COURT_CITATION",
        ParallelCitation => "PARALLEL_CITATION",

        // Statutory citations
        StatuteCitation => "STATUTE_CITATION",
        FederalStatuteCitation => "FEDERAL_STATUTE_CITATION",
        StateStatuteCitation => "STATE_STATUTE_CITATION",
        StateCodeCitation => "STATE_CODE_CITATION",
        SessionLawCitation => "SESSION_LAW_CITATION",
        PublicLawCitation => "PUBLIC_LAW_CITATION",
        PrivateLawCitation => "PRIVATE_LAW_CITATION",
        BillCitation => "BILL_CITATION",
        ResolutionCitation => "RESOLUTION_CITATION",

        // Regulatory and administrative citations
        RegulationCitation => "REGULATION_CITATION",
        CfrCitation => "CFR_CITATION",
        FederalRegisterCitation => "FEDERAL_REGISTER_CITATION",
        StateRegulationCitation => "STATE_REGULATION_CITATION",
        AdministrativeCodeCitation => "ADMINISTRATIVE_CODE_CITATION",
        AdministrativeRulingCitation => "ADMINISTRATIVE_RULING_CITATION",
        AgencyDecisionCitation => "AGENCY_DECISION_CITATION",
        ExecutiveOrderCitation => "EXECUTIVE_ORDER_CITATION",

        // Constitutional citations
        ConstitutionalCitation => "CONSTITUTIONAL_CITATION",
        StateConstitutionCitation => "STATE_CONSTITUTION_CITATION",
        AmendmentCitation => "AMENDMENT_CITATION",

        // Rules of procedure and court rules
        CourtRuleCitation => "COURT_RULE_CITATION",
        FrcpCitation => "FRCP_CITATION",
        FrcrpCitation => "FRCRP_CITATION",
        FreCitation => "FRE_CITATION",
        FrapCitation => "FRAP_CITATION",
        FrbpCitation => "FRBP_CITATION",
        LocalRuleCitation => "LOCAL_RULE_CITATION",
        StandingOrderCitation => "STANDING_ORDER_CITATION",

        // Secondary sources
        LawReviewCitation => "LAW_REVIEW_CITATION",
        LawJournalCitation => "LAW_JOURNAL_CITATION",
        RestatementCitation => "RESTATEMENT_CITATION",
        TreatiseCitation => "TREATISE_CITATION",
        LegalEncyclopediaCitation => "LEGAL_ENCYCLOPEDIA_CITATION",
        AlrCitation => "ALR_CITATION",
        BookCitation => "BOOK_CITATION",

        // Signal citations
        SeeCitation => "SEE_CITATION",
        SeeAlsoCitation => "SEE_ALSO_CITATION",
        SeeGenerallyCitation => "SEE_GENERALLY_CITATION",
        CfCitation => "CF_CITATION",
        CompareCitation => "COMPARE_CITATION",
        ContraCitation => "CONTRA_CITATION",
        ButSeeCitation => "BUT_SEE_CITATION",
        AccordCitation => "ACCORD_CITATION",

        // Short forms and pinpoints
        IdCitation => "ID_CITATION",
        SupraCitation => "SUPRA_CITATION",
        InfraCitation => "INFRA_CITATION",
        ShortFormCitation => "SHORT_FORM_CITATION",
        PageCitation => "PAGE_CITATION",
        ParagraphCitation => "PARAGRAPH_CITATION",
        SectionCitation => "SECTION_CITATION",
        FootnoteCitation => "FOOTNOTE_CITATION",
        LineCitation => "LINE_CITATION",
        CrossReference => "CROSS_REFERENCE",
    }
}

/// Result of canonicalising a declared type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalType {
    Entity(EntityType),
    Citation(CitationType),
}

impl CanonicalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalType::Entity(e) => e.as_str(),
            CanonicalType::Citation(c) => c.as_str(),
        }
    }

    pub fn is_citation(&self) -> bool {
        matches!(self, CanonicalType::Citation(_))
    }
}

/// A canonicalised type plus whether the fallback was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canonicalized {
    pub canonical: CanonicalType,
    pub is_fallback: bool,
}

/// Translation table from source names to canonical type names.
///
/// Merges a built-in table (pattern-file section names and common LLM
/// spellings) with an optional JSON file so deployments can extend it
/// without a rebuild. Unknown names never become new canonical values.
#[derive(Debug, Clone)]
pub struct AliasMap {
    aliases: HashMap<String, String>,
}

impl AliasMap {
    /// Built-in aliases only.
    pub fn builtin() -> Self {
        let mut aliases = HashMap::new();
        for (from, to) in BUILTIN_ALIASES {
            aliases.insert((*from).to_string(), (*to).to_string());
        }
        Self { aliases }
    }

    /// Load aliases from a JSON file and merge over the built-ins.
    /// A missing or unreadable file is a warning, not an error.
    pub fn load(path: &Path) -> Self {
        let mut map = Self::builtin();

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Entity alias file not found at {:?}: {}", path, e);
                return map;
            }
        };

        #[derive(Deserialize)]
        struct AliasFile {
            #[serde(default)]
            entity_type_aliases: HashMap<String, String>,
        }

        match serde_json::from_str::<AliasFile>(&content) {
            Ok(file) => {
                debug!(
                    "Loaded {} entity type aliases from {:?}",
                    file.entity_type_aliases.len(),
                    path
                );
                for (from, to) in file.entity_type_aliases {
                    map.aliases.insert(normalize(&from), normalize(&to));
                }
            }
            Err(e) => warn!("Failed to parse entity alias file {:?}: {}", path, e),
        }

        map
    }

    /// Resolve a raw declared name to its canonical string form without
    /// validating against the closed enums.
    pub fn canonical_name(&self, raw: &str) -> String {
        let normalized = normalize(raw);
        self.aliases
            .get(&normalized)
            .cloned()
            .unwrap_or(normalized)
    }

    /// Canonicalise a declared type name. Citation names win over entity
    /// names; anything unresolvable falls back to `LEGAL_CONCEPT`.
    pub fn canonicalize(&self, raw: &str) -> Canonicalized {
        let name = self.canonical_name(raw);

        if let Some(citation) = CitationType::parse(&name) {
            return Canonicalized {
                canonical: CanonicalType::Citation(citation),
                is_fallback: false,
            };
        }
        if let Some(entity) = EntityType::parse(&name) {
            return Canonicalized {
                canonical: CanonicalType::Entity(entity),
                is_fallback: false,
            };
        }

        Canonicalized {
            canonical: CanonicalType::Entity(EntityType::LegalConcept),
            is_fallback: true,
        }
    }
}

/// Uppercase, trim, and join words with underscores: `"Case Citation"` and
/// `"case_citation"` both normalise to `CASE_CITATION`.
fn normalize(raw: &str) -> String {
    raw.trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_uppercase()
}

/// Section-name and common-spelling aliases carried over from the pattern
/// library conventions. Keys are pre-normalised.
const BUILTIN_ALIASES: &[(&str, &str)] = &[
    // Pattern-file section names
    ("ATTORNEYS", "ATTORNEY"),
    ("JUDGES", "JUDGE"),
    ("JUSTICES", "JUSTICE"),
    ("COURTS", "COURT"),
    ("PARTIES", "PARTY"),
    ("DISTRICTS", "DISTRICT"),
    ("JURISDICTIONS", "JURISDICTION"),
    ("VENUES", "VENUE"),
    ("DOCUMENTS", "DOCUMENT"),
    ("MOTIONS", "MOTION"),
    ("BRIEFS", "BRIEF"),
    ("ORDERS", "ORDER"),
    ("JUDGMENTS", "JUDGMENT"),
    ("DATES", "DATE"),
    ("MONETARY", "MONETARY_AMOUNT"),
    ("PROCEDURAL", "PROCEDURAL_RULE"),
    ("ORGANIZATIONS", "ORGANIZATION"),
    ("LOCATIONS", "LOCATION"),
    ("CASE_CITATIONS", "CASE_CITATION"),
    ("CITATIONS", "CASE_CITATION"),
    ("FEDERAL_CITATIONS", "FEDERAL_CASE_CITATION"),
    ("STATE_CITATIONS", "STATE_CASE_CITATION"),
    ("STATUTE_CITATIONS", "STATUTE_CITATION"),
    ("REGULATION_CITATIONS", "REGULATION_CITATION"),
    ("CONSTITUTIONAL_CITATIONS", "CONSTITUTIONAL_CITATION"),
    // Common LLM spellings
    ("LEGAL_CASE", "CASE_CITATION"),
    ("CASE_REFERENCE", "CASE_CITATION"),
    ("LEGAL_CITATION", "CASE_CITATION"),
    ("CODE", "CODE_SECTION"),
    ("MONEY", "MONETARY_AMOUNT"),
    ("AMOUNT", "MONETARY_AMOUNT"),
    ("DOLLAR_AMOUNT", "MONETARY_AMOUNT"),
    ("YEAR", "DATE"),
    ("TIME_REFERENCE", "TIME"),
    ("COMPANY", "CORPORATION"),
    ("AGENCY", "GOVERNMENT_AGENCY"),
    ("GOVERNMENT", "GOVERNMENT_ENTITY"),
    ("COUNSEL", "ATTORNEY"),
    ("LAWYER", "ATTORNEY"),
    ("DOCTRINE", "LEGAL_DOCTRINE"),
    ("THEORY", "LEGAL_THEORY"),
    ("TERM", "LEGAL_TERM"),
    ("STANDARD", "LEGAL_STANDARD"),
    ("CONCEPT", "LEGAL_CONCEPT"),
    ("OTHER", "LEGAL_CONCEPT"),
];
