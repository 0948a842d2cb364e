//! Classification of free-text document titles into the destination taxonomy.
//!
//! Matching is a fixed algorithm over ordered rule tables:
//!
//! 1. exact, case-sensitive title match ([`Taxonomy::titles`]);
//! 2. case-insensitive substring match, first keyword in table order wins
//!    ([`Taxonomy::keywords`]);
//! 3. the configured default document name.
//!
//! The resulting document name is then mapped to `(subcategory, category)` through
//! [`Taxonomy::categories`]. Attachments go through [`Taxonomy::classify_attachment`],
//! which consults the attachment-type rules before the keyword table.
//!
//! Everything here is pure: no I/O, no interior state.

use serde::{Deserialize, Serialize};

/// The taxonomy triple written to the destination's "Category" attribute set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Classification {
    pub document_name: String,
    pub subcategory: String,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleRule {
    pub title: String,
    pub document_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRule {
    pub keyword: String,
    pub document_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentTypeRule {
    pub attachment_type: String,
    pub document_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub document_names: Vec<String>,
    pub subcategory: String,
    pub category: String,
}

/// Rule tables plus defaults. Any table may be overridden from configuration; an
/// overridden table replaces the built-in one wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Taxonomy {
    pub titles: Vec<TitleRule>,
    pub keywords: Vec<KeywordRule>,
    pub attachment_types: Vec<AttachmentTypeRule>,
    pub categories: Vec<CategoryRule>,
    pub default_document_name: String,
    pub default_subcategory: String,
    pub default_category: String,
}

impl Taxonomy {
    /// Classifies an activity title.
    pub fn classify(&self, raw_title: &str) -> Classification {
        let document_name = self
            .match_title(raw_title)
            .or_else(|| self.match_keyword(raw_title))
            .unwrap_or(self.default_document_name.as_str());
        self.classification_for(document_name)
    }

    /// Classifies an attachment by its type first, then by keywords in its
    /// description.
    pub fn classify_attachment(
        &self,
        attachment_type: Option<&str>,
        description: &str,
    ) -> Classification {
        let by_type = attachment_type.and_then(|kind| {
            self.attachment_types
                .iter()
                .find(|rule| rule.attachment_type == kind)
                .map(|rule| rule.document_name.as_str())
        });
        let document_name = by_type
            .or_else(|| self.match_keyword(description))
            .unwrap_or(self.default_document_name.as_str());
        self.classification_for(document_name)
    }

    /// True when `document_name` is the fallback, i.e. nothing matched.
    pub fn is_default(&self, classification: &Classification) -> bool {
        classification.document_name == self.default_document_name
    }

    /// Maps a normalised document name to `(subcategory, category)`.
    pub fn categorize(&self, document_name: &str) -> (&str, &str) {
        self.categories
            .iter()
            .find(|rule| rule.document_names.iter().any(|name| name == document_name))
            .map(|rule| (rule.subcategory.as_str(), rule.category.as_str()))
            .unwrap_or((
                self.default_subcategory.as_str(),
                self.default_category.as_str(),
            ))
    }

    fn classification_for(&self, document_name: &str) -> Classification {
        let (subcategory, category) = self.categorize(document_name);
        Classification {
            document_name: document_name.to_string(),
            subcategory: subcategory.to_string(),
            category: category.to_string(),
        }
    }

    fn match_title(&self, raw_title: &str) -> Option<&str> {
        self.titles
            .iter()
            .find(|rule| rule.title == raw_title)
            .map(|rule| rule.document_name.as_str())
    }

    fn match_keyword(&self, text: &str) -> Option<&str> {
        let haystack = text.to_lowercase();
        self.keywords
            .iter()
            .find(|rule| haystack.contains(&rule.keyword.to_lowercase()))
            .map(|rule| rule.document_name.as_str())
    }
}

const DEFAULT_TITLES: &[(&str, &str)] = &[
    ("01 PMS Arbitration Agreement", "Arbitration Agreement"),
    ("02 PMS Driving Policy", "Driving Policy"),
    ("03 - I-9", "I9"),
    ("03 PMS Telephone Policy", "Company Issued Mobile Phone Policy"),
    ("04 PMS IIPP", "IIPP"),
    ("05 - W-4", "Tax Forms"),
    ("Arbitration Agreement PMCA", "Arbitration Agreement"),
    ("At-Will Acknowledgment", "At-Will Employment"),
    ("At-Will Acknowledgment PMCA", "At-Will Employment"),
    ("Code of Bus. Cond. and Ethical Bus. Ack. Form", "Code of Conduct"),
    ("Criminal Sanctions Exclusion Attestation PMCA", "Background Checks"),
    (
        // The source stores this title with its en dash mis-decoded as cp1252.
        "Discrimination & Harassment CA \u{e2}\u{20ac}\u{201c}PMCA (PMS Clinics)",
        "Unlawful Harassment",
    ),
    (
        "Discrimination and Harassment Policy - PMH PMS CRC",
        "Unlawful Harassment",
    ),
    ("Driving Policy PMCA", "Driving Policy"),
    ("Employee Information Sheet", "EE Info Sheet"),
    ("FAMA Acknowledgement - PMS/PMCA", "FAMA"),
    ("Meal Period Waiver Agreement PMS_PMCA", "Meal Period Waiver"),
    ("MSO/IPA Compliance Program", "MSO - IPA"),
    ("PMCA - Employee Handbook Acknowledgement", "Employee Handbook"),
    ("PMCA - HIPAA CONFIDENTIALITY AGREEMENT (PHI)", "HIPAA Agreement"),
    ("PMCA Vehicle Registration Form", "Vehicle Registration Form"),
    ("PMH Confidentiality Agreement", "Confidential Archive"),
    ("PMH EE_Handbook_Acknowledgement", "Employee Handbook"),
    ("PMS - Employee Handbook Acknowledgement", "Employee Handbook"),
    ("PMS HIPAA CONFIDENTIALITY AGREEMENT (PHI)", "HIPAA Agreement"),
    ("PMS IIPP Acknowledgement", "IIPP"),
    (
        "PMS Onboarding Criminal Sanctions Exclusion Attest",
        "Background Checks",
    ),
    ("PMS Vehicle Registration Form", "Vehicle Registration Form"),
    (
        "Prospect and Subsidaries Confidentiality Agreement",
        "Confidential Archive",
    ),
    ("Prospect Confidentiality Agreement", "Confidential Archive"),
    ("Telephone Call Recording", "Call Monitoring"),
];

// Order matters: short keywords such as "rn" shadow anything listed after them.
const DEFAULT_KEYWORDS: &[(&str, &str)] = &[
    ("i-9", "I9"),
    ("i9", "I9"),
    ("permanent residence card", "I9"),
    ("perm res", "I9"),
    ("social security card", "I9"),
    ("driver's license", "I9"),
    ("driver license", "I9"),
    ("birth certificate", "I9"),
    ("birth cert", "I9"),
    ("passport", "I9"),
    ("offer letter", "Offer Letter"),
    ("voided check", "Direct Deposit Forms"),
    ("direct deposit", "Direct Deposit Forms"),
    ("rn", "Certs and Licenses"),
    ("cna", "Certs and Licenses"),
    ("license", "Certs and Licenses"),
    ("psv", "Certs and Licenses"),
    ("sv", "Certs and Licenses"),
    ("bls", "Certs and Licenses"),
    ("acls", "Certs and Licenses"),
    ("sama", "Certs and Licenses"),
    ("mab", "Certs and Licenses"),
    ("fire", "Certs and Licenses"),
    ("ekg", "Certs and Licenses"),
    ("cpt", "Certs and Licenses"),
    ("safety", "Certs and Licenses"),
    ("aha", "Certs and Licenses"),
    ("pals", "Certs and Licenses"),
    ("cpi", "Certs and Licenses"),
    ("e-verify", "Confidential Archive"),
    ("everify", "Confidential Archive"),
    ("resume", "Resume"),
    ("healthcare", "Confidential Archive"),
    ("assessment", "Confidential Archive"),
    ("source", "Confidential Archive"),
    ("report", "Confidential Archive"),
    ("selection", "Confidential Archive"),
    ("scf", "SCF"),
    ("recommend", "Resume"),
    ("telephone call recording", "Call Monitoring"),
];

const DEFAULT_ATTACHMENT_TYPES: &[(&str, &str)] = &[
    ("Resume_Type", "Resume"),
    ("Offer_Type", "Offer Letter"),
];

const DEFAULT_CATEGORIES: &[(&[&str], &str, &str)] = &[
    (
        &[
            "1040 Form",
            "Benefit Files",
            "Benefit Files Archive",
            "Benefits SCF",
            "Birth Certificate",
            "Enrollment",
            "Family Status Change",
            "Marriage License",
            "New Hire Letter",
            "No Change - Decline",
            "Tobacco Declaration",
            "Unum Cancellation",
        ],
        "Benefit Files",
        "Benefit Files",
    ),
    (&["EEOC", "EEOC Archive"], "EEOC", "EEOC"),
    (
        &[
            "Code of Conduct",
            "Compliance Archive",
            // Trailing space kept: "MSO - IPA" documents fall back to the default category.
            "MSO - IPA ",
            "OIG - EPLS 'SAM'",
            "Training Acknowledgment",
        ],
        "Compliance",
        "Employee Files",
    ),
    (
        &[
            "Background Checks",
            "Certs and Licenses",
            "Confidential Archive",
            "Employment Verification",
            "Misc. Confidential",
        ],
        "Confidential",
        "Employee Files",
    ),
    (
        &[
            "Arbitration Agreement",
            "At-Will Employment",
            "Benefit Acknowledgment",
            "Call Monitoring",
            "COD",
            "Company Issued Mobile Phone Policy",
            "Driving Policy",
            "EE Info Sheet",
            "Employee Confidentiality Agreement",
            "Employee Handbook",
            "Ergo Evaluation",
            "HIPAA Agreement",
            "IIPP",
            "NDA Agreement",
            "New Hire Checklist",
            "Notice to Employee",
            "Onboarding Archive",
            "Prospect Medical Confidentiality Agreement",
            "SYOD",
            "Unlawful Harassment",
            "Vehicle Registration Form",
        ],
        "Onboarding",
        "Employee Files",
    ),
    (
        &[
            "Internal Application",
            "Other Archive",
            "Other Docs",
            "Safety Checklist",
            "Teleworker Agreement",
        ],
        "Other",
        "Employee Files",
    ),
    (
        &["Direct Deposit Forms", "Tax Forms"],
        "Payroll",
        "Employee Files",
    ),
    (
        &["Counseling Forms", "Performance Archive", "Reviews and Evals"],
        "Performance",
        "Employee Files",
    ),
    (
        &[
            "Application",
            "Interviews and References",
            "Job Description",
            "Offer Letter",
            "Pre-Employment Archive",
            "References",
            "Resume",
            "Staffing Requisition",
            "Testing Results",
        ],
        "Pre-Employment",
        "Employee Files",
    ),
    (
        &["SCF", "Status Changes Archive"],
        "Status Changes",
        "Employee Files",
    ),
    (&["Term File"], "Term File", "Employee Files"),
    (&["I9", "I9 Archive"], "I9", "I9"),
    (
        &[
            "ADA Letter",
            "Doctor Notes",
            "Exhausted FMLA",
            "Extension",
            "Initial Letter",
            "Leave of Absence",
            "Leave of Absence Archive",
            "Medical Cert",
            "Request",
        ],
        "Leave of absence",
        "Leave of Absence",
    ),
    (&["Payroll", "Payroll Archive"], "Payroll", "Payroll"),
    (
        &["Workers Compensation", "Workers Compensation Archive"],
        "Workers Compensation",
        "Workers Compensation",
    ),
];

impl Default for Taxonomy {
    fn default() -> Self {
        Self {
            titles: DEFAULT_TITLES
                .iter()
                .map(|(title, name)| TitleRule {
                    title: title.to_string(),
                    document_name: name.to_string(),
                })
                .collect(),
            keywords: DEFAULT_KEYWORDS
                .iter()
                .map(|(keyword, name)| KeywordRule {
                    keyword: keyword.to_string(),
                    document_name: name.to_string(),
                })
                .collect(),
            attachment_types: DEFAULT_ATTACHMENT_TYPES
                .iter()
                .map(|(kind, name)| AttachmentTypeRule {
                    attachment_type: kind.to_string(),
                    document_name: name.to_string(),
                })
                .collect(),
            categories: DEFAULT_CATEGORIES
                .iter()
                .map(|(names, subcategory, category)| CategoryRule {
                    document_names: names.iter().map(|n| n.to_string()).collect(),
                    subcategory: subcategory.to_string(),
                    category: category.to_string(),
                })
                .collect(),
            default_document_name: "Other Docs".to_string(),
            default_subcategory: "Other".to_string(),
            default_category: "Employee Files".to_string(),
        }
    }
}
