// =============================================================================
// classifier.rs - TYPE CODE -> CATEGORY -> PARTY LABELS
// =============================================================================
//
// The court's type-code vocabulary overlaps with itself. 브 is both a family
// appeal and a family application. 즈단 is a family code and a preservation
// code. 보 starts a whole family of criminal codes. So classification is an
// ordered list of (matcher, category) rules evaluated top to bottom, and the
// first match wins.
//
// The order of CLASSIFICATION_RULES is load-bearing. The tests at the bottom
// lock it against the full code table; reorder the rules and they fail.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::case_number::CaseIdentifier;

/// Legal category of a case, derived from its type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseCategory {
    Criminal,
    Appeal,
    FamilyPreservation,
    FamilyNonLitigation,
    CivilApplication,
    Enforcement,
    Insolvency,
    ElectronicOrder,
    FamilyProtection,
    JuvenileProtection,
    /// Fallback for everything no rule claims.
    Civil,
}

impl fmt::Display for CaseCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaseCategory::Criminal => "criminal",
            CaseCategory::Appeal => "appeal",
            CaseCategory::FamilyPreservation => "family_preservation",
            CaseCategory::FamilyNonLitigation => "family_non_litigation",
            CaseCategory::CivilApplication => "civil_application",
            CaseCategory::Enforcement => "enforcement",
            CaseCategory::Insolvency => "insolvency",
            CaseCategory::ElectronicOrder => "electronic_order",
            CaseCategory::FamilyProtection => "family_protection",
            CaseCategory::JuvenileProtection => "juvenile_protection",
            CaseCategory::Civil => "civil",
        };
        write!(f, "{name}")
    }
}

/// A set of type codes: exact members plus prefix members.
#[derive(Debug)]
pub struct CodeSet {
    exact: &'static [&'static str],
    prefixes: &'static [&'static str],
}

impl CodeSet {
    pub fn matches(&self, code: &str) -> bool {
        self.exact.contains(&code) || self.prefixes.iter().any(|p| code.starts_with(p))
    }
}

const CRIMINAL: CodeSet = CodeSet {
    exact: &[],
    prefixes: &[
        "고단", "고합", "고약", "고정",
        "노", "도", "로", "모", "오",
        "초",
        "감고", "감노", "감도", "감로", "감모", "감오", "감초",
        "보",
        "전고", "전노", "전도", "전로", "전모", "전오", "전초",
        "치고", "치노", "치도", "치로", "치모", "치오", "치초",
        "동고", "동노", "동도", "동오", "동초",
        "재고", "재감", "재노", "재도", "재무", "재수",
        "무", "수", "과",
    ],
};

const APPEAL: CodeSet = CodeSet {
    exact: &["나", "다", "그", "마", "누", "두", "르", "므", "너", "브", "호파"],
    prefixes: &[],
};

const FAMILY_PRESERVATION: CodeSet = CodeSet {
    exact: &["즈단", "즈합"],
    prefixes: &[],
};

// 르 and 브 belong here too, but the appeal rule claims them first.
const FAMILY_NON_LITIGATION: CodeSet = CodeSet {
    exact: &[
        "즈기", "느단", "느합", "르", "브", "스", "조",
        "후기", "후개", "후단", "호", "호기", "호명", "호협",
    ],
    prefixes: &[],
};

const CIVIL_APPLICATION: CodeSet = CodeSet {
    exact: &["브"],
    prefixes: &["카"],
};

const ENFORCEMENT: CodeSet = CodeSet {
    exact: &["정드"],
    prefixes: &["타"],
};

const INSOLVENCY: CodeSet = CodeSet {
    exact: &[],
    prefixes: &["하", "개", "회", "간회"],
};

const ELECTRONIC_ORDER: CodeSet = CodeSet {
    exact: &["차", "차전", "자"],
    prefixes: &[],
};

const FAMILY_PROTECTION: CodeSet = CodeSet {
    exact: &["동버", "버"],
    prefixes: &[],
};

const JUVENILE_PROTECTION: CodeSet = CodeSet {
    exact: &["푸"],
    prefixes: &[],
};

/// Evaluated top to bottom; first match wins.
pub static CLASSIFICATION_RULES: &[(&CodeSet, CaseCategory)] = &[
    (&CRIMINAL, CaseCategory::Criminal),
    (&APPEAL, CaseCategory::Appeal),
    (&FAMILY_PRESERVATION, CaseCategory::FamilyPreservation),
    (&FAMILY_NON_LITIGATION, CaseCategory::FamilyNonLitigation),
    (&CIVIL_APPLICATION, CaseCategory::CivilApplication),
    (&ENFORCEMENT, CaseCategory::Enforcement),
    (&INSOLVENCY, CaseCategory::Insolvency),
    (&ELECTRONIC_ORDER, CaseCategory::ElectronicOrder),
    (&FAMILY_PROTECTION, CaseCategory::FamilyProtection),
    (&JUVENILE_PROTECTION, CaseCategory::JuvenileProtection),
];

/// Codes whose cases are filed as applications rather than suits.
const APPLICATION_CODES: &[&str] = &[
    "카단", "카합", "카기", "카공", "카담", "즈단", "즈합", "즈기", "브",
];

/// Outcome of classifying an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub category: CaseCategory,
    pub is_criminal: bool,
    pub is_application_type: bool,
}

fn match_rules(type_code: &str) -> Option<CaseCategory> {
    CLASSIFICATION_RULES
        .iter()
        .find(|(set, _)| set.matches(type_code))
        .map(|(_, category)| *category)
}

fn classification_for(category: CaseCategory, type_code: &str) -> Classification {
    Classification {
        category,
        is_criminal: category == CaseCategory::Criminal,
        is_application_type: APPLICATION_CODES.contains(&type_code),
    }
}

/// Classify by type code alone.
pub fn classify(id: &CaseIdentifier) -> Classification {
    classify_code(&id.type_code)
}

pub fn classify_code(type_code: &str) -> Classification {
    let category = match_rules(type_code).unwrap_or(CaseCategory::Civil);
    classification_for(category, type_code)
}

/// Classify, letting a case-type name decide when the code itself is unknown.
pub fn classify_with_hint(id: &CaseIdentifier, case_type_name: Option<&str>) -> Classification {
    if let Some(category) = match_rules(&id.type_code) {
        return classification_for(category, &id.type_code);
    }
    let category = match case_type_name {
        Some(name) if ["가압류", "가처분", "보전"].iter().any(|k| name.contains(k)) => {
            CaseCategory::CivilApplication
        }
        Some(name) if name.contains("형사") => CaseCategory::Criminal,
        Some(name) if name.contains("가사신청") || name.contains("사전처분") => {
            CaseCategory::FamilyNonLitigation
        }
        _ => CaseCategory::Civil,
    };
    classification_for(category, &id.type_code)
}

// =============================================================================
// PARTY LABELS
// =============================================================================

/// Party roles as the portal names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyRole {
    Plaintiff,
    Defendant,
    DefendantInPerson,
    Creditor,
    Debtor,
    Applicant,
    Respondent,
    Appellant,
    Counterparty,
    Actor,
    AffectedMinor,
    Investigator,
    ProtectedMinor,
}

impl PartyRole {
    pub fn label(&self) -> &'static str {
        match self {
            PartyRole::Plaintiff => "원고",
            PartyRole::Defendant => "피고",
            PartyRole::DefendantInPerson => "피고인",
            PartyRole::Creditor => "채권자",
            PartyRole::Debtor => "채무자",
            PartyRole::Applicant => "신청인",
            PartyRole::Respondent => "피신청인",
            PartyRole::Appellant => "항고인",
            PartyRole::Counterparty => "상대방",
            PartyRole::Actor => "행위자",
            PartyRole::AffectedMinor => "피해아동",
            PartyRole::Investigator => "조사관",
            PartyRole::ProtectedMinor => "보호소년",
        }
    }
}

/// Role pair for the two sides of a case. Criminal cases have no plaintiff side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartyLabelSet {
    pub plaintiff: Option<PartyRole>,
    pub defendant: PartyRole,
    pub is_criminal: bool,
}

impl PartyLabelSet {
    pub fn plaintiff_label(&self) -> &'static str {
        self.plaintiff.map(|r| r.label()).unwrap_or("")
    }

    pub fn defendant_label(&self) -> &'static str {
        self.defendant.label()
    }
}

const fn pair(plaintiff: PartyRole, defendant: PartyRole) -> PartyLabelSet {
    PartyLabelSet { plaintiff: Some(plaintiff), defendant, is_criminal: false }
}

pub fn labels_for_category(category: CaseCategory) -> PartyLabelSet {
    use PartyRole::*;
    match category {
        CaseCategory::Civil => pair(Plaintiff, Defendant),
        CaseCategory::Criminal => PartyLabelSet {
            plaintiff: None,
            defendant: DefendantInPerson,
            is_criminal: true,
        },
        CaseCategory::FamilyPreservation => pair(Creditor, Debtor),
        CaseCategory::FamilyNonLitigation => pair(Applicant, Respondent),
        CaseCategory::CivilApplication => pair(Applicant, Respondent),
        CaseCategory::Enforcement => pair(Creditor, Debtor),
        CaseCategory::Insolvency => pair(Applicant, Debtor),
        CaseCategory::ElectronicOrder => pair(Creditor, Debtor),
        CaseCategory::FamilyProtection => pair(Actor, AffectedMinor),
        CaseCategory::JuvenileProtection => pair(Investigator, ProtectedMinor),
        CaseCategory::Appeal => pair(Appellant, Counterparty),
    }
}

pub fn party_labels(id: &CaseIdentifier) -> PartyLabelSet {
    labels_for_category(classify(id).category)
}

// =============================================================================
// PORTAL ROUTING
// =============================================================================

/// Which detail screen family of the portal serves a type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PortalRoute {
    Civil,
    Family,
    Application,
    Other,
    Criminal,
}

impl PortalRoute {
    pub fn screen(&self) -> &'static str {
        match self {
            PortalRoute::Civil => "ssgo101",
            PortalRoute::Family => "ssgo102",
            PortalRoute::Application => "ssgo105",
            PortalRoute::Other => "ssgo106",
            PortalRoute::Criminal => "ssgo10g",
        }
    }

    /// Path of the static layout document for the route's basic-info screen.
    pub fn layout_path(&self) -> String {
        let screen = self.screen();
        format!("{screen}/{}F01.xml", screen.to_ascii_uppercase())
    }
}

const ROUTE_TABLE: &[(&[char], PortalRoute)] = &[
    (&['아', '구', '카', '타', '파', '하'], PortalRoute::Application),
    (&['드', '느', '므', '머', '브', '스', '으', '즈', '흐'], PortalRoute::Family),
    (&['고', '노', '도', '로', '모', '보', '소', '오', '조', '초'], PortalRoute::Criminal),
    (&['가', '나', '다', '라', '마', '바', '사', '자', '차'], PortalRoute::Civil),
    (&['거', '버', '서', '어', '저', '처'], PortalRoute::Other),
];

/// Route by the first syllable of the type code. Unknown codes go to the
/// family screens, which accept the widest range of case types.
pub fn portal_route(type_code: &str) -> PortalRoute {
    let Some(first) = type_code.chars().next() else {
        return PortalRoute::Family;
    };
    ROUTE_TABLE
        .iter()
        .find(|(chars, _)| chars.contains(&first))
        .map(|(_, route)| *route)
        .unwrap_or(PortalRoute::Family)
}

/// Numeric type codes the portal expects in compact case numbers. Only codes
/// observed on the wire are listed.
pub fn numeric_type_code(type_code: &str) -> Option<&'static str> {
    match type_code {
        "드단" => Some("150"),
        "드합" => Some("151"),
        "느단" => Some("140"),
        "느합" => Some("141"),
        "호" => Some("120"),
        "르" => Some("160"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case_number::parse;
    use pretty_assertions::assert_eq;

    fn category(code: &str) -> CaseCategory {
        classify_code(code).category
    }

    #[test]
    fn test_reference_scenarios() {
        let id = parse("2025즈기1108").unwrap();
        assert_eq!(classify(&id).category, CaseCategory::FamilyNonLitigation);
        let labels = party_labels(&id);
        assert_eq!(labels.plaintiff, Some(PartyRole::Applicant));
        assert_eq!(labels.defendant, PartyRole::Respondent);

        let id = parse("2025카단1234").unwrap();
        assert_eq!(classify(&id).category, CaseCategory::CivilApplication);
        let labels = party_labels(&id);
        assert_eq!(labels.plaintiff_label(), "신청인");
        assert_eq!(labels.defendant_label(), "피신청인");

        let id = parse("2025드단1234").unwrap();
        assert_eq!(classify(&id).category, CaseCategory::Civil);
        let labels = party_labels(&id);
        assert_eq!(labels.plaintiff, Some(PartyRole::Plaintiff));
        assert_eq!(labels.defendant, PartyRole::Defendant);
    }

    /// Locks the rule order against the full code table.
    #[test]
    fn test_full_code_table_is_locked() {
        let table: &[(&str, CaseCategory)] = &[
            // civil fallback
            ("가단", CaseCategory::Civil),
            ("가합", CaseCategory::Civil),
            ("가소", CaseCategory::Civil),
            ("가기", CaseCategory::Civil),
            ("라", CaseCategory::Civil),
            ("머", CaseCategory::Civil),
            ("드단", CaseCategory::Civil),
            ("드합", CaseCategory::Civil),
            ("구합", CaseCategory::Civil),
            ("구단", CaseCategory::Civil),
            ("루", CaseCategory::Civil),
            // criminal
            ("고단", CaseCategory::Criminal),
            ("고합", CaseCategory::Criminal),
            ("고약", CaseCategory::Criminal),
            ("고약전", CaseCategory::Criminal),
            ("고정", CaseCategory::Criminal),
            ("노", CaseCategory::Criminal),
            ("도", CaseCategory::Criminal),
            ("로", CaseCategory::Criminal),
            ("모", CaseCategory::Criminal),
            ("오", CaseCategory::Criminal),
            ("초", CaseCategory::Criminal),
            ("초기", CaseCategory::Criminal),
            ("초재", CaseCategory::Criminal),
            ("감고", CaseCategory::Criminal),
            ("보", CaseCategory::Criminal),
            ("보고", CaseCategory::Criminal),
            ("전고", CaseCategory::Criminal),
            ("치고", CaseCategory::Criminal),
            ("동고", CaseCategory::Criminal),
            ("재고단", CaseCategory::Criminal),
            ("재노", CaseCategory::Criminal),
            ("무", CaseCategory::Criminal),
            ("수", CaseCategory::Criminal),
            ("수흐", CaseCategory::Criminal),
            ("과", CaseCategory::Criminal),
            // appeal beats the family and application rules
            ("나", CaseCategory::Appeal),
            ("다", CaseCategory::Appeal),
            ("그", CaseCategory::Appeal),
            ("마", CaseCategory::Appeal),
            ("누", CaseCategory::Appeal),
            ("두", CaseCategory::Appeal),
            ("르", CaseCategory::Appeal),
            ("므", CaseCategory::Appeal),
            ("너", CaseCategory::Appeal),
            ("브", CaseCategory::Appeal),
            ("호파", CaseCategory::Appeal),
            // family preservation
            ("즈단", CaseCategory::FamilyPreservation),
            ("즈합", CaseCategory::FamilyPreservation),
            // family non-litigation
            ("즈기", CaseCategory::FamilyNonLitigation),
            ("느단", CaseCategory::FamilyNonLitigation),
            ("느합", CaseCategory::FamilyNonLitigation),
            ("스", CaseCategory::FamilyNonLitigation),
            ("조", CaseCategory::FamilyNonLitigation),
            ("후기", CaseCategory::FamilyNonLitigation),
            ("후개", CaseCategory::FamilyNonLitigation),
            ("후단", CaseCategory::FamilyNonLitigation),
            ("호", CaseCategory::FamilyNonLitigation),
            ("호기", CaseCategory::FamilyNonLitigation),
            ("호명", CaseCategory::FamilyNonLitigation),
            ("호협", CaseCategory::FamilyNonLitigation),
            // civil application
            ("카단", CaseCategory::CivilApplication),
            ("카합", CaseCategory::CivilApplication),
            ("카기", CaseCategory::CivilApplication),
            ("카기전", CaseCategory::CivilApplication),
            ("카공", CaseCategory::CivilApplication),
            ("카담", CaseCategory::CivilApplication),
            ("카명", CaseCategory::CivilApplication),
            ("카불", CaseCategory::CivilApplication),
            // enforcement
            ("타기", CaseCategory::Enforcement),
            ("타배", CaseCategory::Enforcement),
            ("타채", CaseCategory::Enforcement),
            ("타경", CaseCategory::Enforcement),
            ("정드", CaseCategory::Enforcement),
            // insolvency
            ("개회", CaseCategory::Insolvency),
            ("개확", CaseCategory::Insolvency),
            ("하단", CaseCategory::Insolvency),
            ("하합", CaseCategory::Insolvency),
            ("하면", CaseCategory::Insolvency),
            ("회단", CaseCategory::Insolvency),
            ("회합", CaseCategory::Insolvency),
            ("간회단", CaseCategory::Insolvency),
            // electronic order
            ("차", CaseCategory::ElectronicOrder),
            ("차전", CaseCategory::ElectronicOrder),
            ("자", CaseCategory::ElectronicOrder),
            // protection
            ("동버", CaseCategory::FamilyProtection),
            ("버", CaseCategory::FamilyProtection),
            ("푸", CaseCategory::JuvenileProtection),
        ];

        for (code, expected) in table {
            assert_eq!(category(code), *expected, "type code {code}");
        }
    }

    #[test]
    fn test_rule_order_is_fixed() {
        let order: Vec<CaseCategory> = CLASSIFICATION_RULES.iter().map(|(_, c)| *c).collect();
        assert_eq!(
            order,
            vec![
                CaseCategory::Criminal,
                CaseCategory::Appeal,
                CaseCategory::FamilyPreservation,
                CaseCategory::FamilyNonLitigation,
                CaseCategory::CivilApplication,
                CaseCategory::Enforcement,
                CaseCategory::Insolvency,
                CaseCategory::ElectronicOrder,
                CaseCategory::FamilyProtection,
                CaseCategory::JuvenileProtection,
            ]
        );
    }

    #[test]
    fn test_classification_depends_only_on_type_code() {
        let a = parse("1999타채1").unwrap();
        let b = parse("서울중앙지방법원 2025타채9999999").unwrap();
        assert_eq!(classify(&a), classify(&b));
        assert_eq!(party_labels(&a), party_labels(&b));
    }

    #[test]
    fn test_criminal_has_no_plaintiff_label() {
        let id = parse("2024고단123").unwrap();
        let c = classify(&id);
        assert!(c.is_criminal);
        let labels = party_labels(&id);
        assert!(labels.is_criminal);
        assert_eq!(labels.plaintiff_label(), "");
        assert_eq!(labels.defendant_label(), "피고인");
    }

    #[test]
    fn test_every_category_has_labels() {
        let expected = [
            (CaseCategory::Civil, "원고", "피고"),
            (CaseCategory::FamilyPreservation, "채권자", "채무자"),
            (CaseCategory::FamilyNonLitigation, "신청인", "피신청인"),
            (CaseCategory::CivilApplication, "신청인", "피신청인"),
            (CaseCategory::Enforcement, "채권자", "채무자"),
            (CaseCategory::Insolvency, "신청인", "채무자"),
            (CaseCategory::ElectronicOrder, "채권자", "채무자"),
            (CaseCategory::FamilyProtection, "행위자", "피해아동"),
            (CaseCategory::JuvenileProtection, "조사관", "보호소년"),
            (CaseCategory::Appeal, "항고인", "상대방"),
        ];
        for (category, plaintiff, defendant) in expected {
            let labels = labels_for_category(category);
            assert_eq!(labels.plaintiff_label(), plaintiff, "{category}");
            assert_eq!(labels.defendant_label(), defendant, "{category}");
            assert!(!labels.is_criminal);
        }
    }

    #[test]
    fn test_application_flag() {
        assert!(classify_code("카단").is_application_type);
        assert!(classify_code("즈기").is_application_type);
        assert!(classify_code("브").is_application_type);
        assert!(!classify_code("가단").is_application_type);
        assert!(!classify_code("카명").is_application_type);
    }

    #[test]
    fn test_name_hint_only_applies_to_unknown_codes() {
        let unknown = parse("2024가단1").unwrap();
        assert_eq!(
            classify_with_hint(&unknown, Some("부동산가압류")).category,
            CaseCategory::CivilApplication
        );
        assert_eq!(classify_with_hint(&unknown, Some("형사")).category, CaseCategory::Criminal);
        assert_eq!(classify_with_hint(&unknown, None).category, CaseCategory::Civil);

        let known = parse("2024타채1").unwrap();
        assert_eq!(
            classify_with_hint(&known, Some("부동산가압류")).category,
            CaseCategory::Enforcement
        );
    }

    #[test]
    fn test_portal_routes() {
        assert_eq!(portal_route("드단"), PortalRoute::Family);
        assert_eq!(portal_route("가단"), PortalRoute::Civil);
        assert_eq!(portal_route("카합"), PortalRoute::Application);
        assert_eq!(portal_route("고단"), PortalRoute::Criminal);
        assert_eq!(portal_route("버"), PortalRoute::Other);
        assert_eq!(portal_route("푸"), PortalRoute::Family);
        assert_eq!(portal_route(""), PortalRoute::Family);
        assert_eq!(PortalRoute::Criminal.layout_path(), "ssgo10g/SSGO10GF01.xml");
        assert_eq!(PortalRoute::Family.layout_path(), "ssgo102/SSGO102F01.xml");
    }
}
