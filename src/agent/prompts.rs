//! Prompt text for each pipeline stage.

use crate::models::{InsuranceType, Language};

/// Document types the classifier may answer with, per line of business.
pub fn document_types(insurance_type: InsuranceType) -> &'static [&'static str] {
    match insurance_type {
        InsuranceType::Life => &[
            "LIFE_INSURANCE_APPLICATION",
            "MEDICAL_REPORT",
            "ATTENDING_PHYSICIAN_STATEMENT",
            "LAB_REPORT",
            "PRESCRIPTION_HISTORY",
            "FINANCIAL_STATEMENT",
        ],
        InsuranceType::PropertyCasualty => &[
            "ACORD_FORM",
            "MEDICAL_REPORT",
            "FINANCIAL_STATEMENT",
            "COMMERCIAL_PROPERTY_APPLICATION",
            "CRIME_REPORT",
            "OTHER",
        ],
    }
}

/// Supporting documents to request for an application type.
pub fn supporting_documents(application_type: &str) -> &'static [&'static str] {
    match application_type {
        "COMMERCIAL_PROPERTY_APPLICATION" => &[
            "Proof of Ownership",
            "Latest Audited Financial Statements (past 2 years)",
            "Property Inspection Report (dated within last 12 months)",
            "Existing Insurance Policy Declarations Page",
        ],
        "GENERAL_LIABILITY_APP_V2" => &[
            "Business License Copy",
            "Prior Claims History Report (5 years)",
            "Safety Program Manual/Overview",
        ],
        "ACORD_FORM" => &[
            "Completed ACORD Forms (all sections)",
            "Property Valuation Documentation",
            "Loss Run Reports (3 years)",
            "Business Continuity Plan",
        ],
        "LIFE_INSURANCE_APPLICATION" => &[
            "Valid Government ID",
            "Medical Records Release Form",
            "Recent Physical Exam Results (within 12 months)",
            "Financial Justification for Coverage Amount",
            "Blood Test and Urinalysis Results (if not completed)",
        ],
        "MEDICAL_REPORT" => &[
            "Complete Medical History for the Past 5 Years",
            "Specialist Consultation Notes",
            "Current Medication List",
            "Recent Lab Test Results",
        ],
        "ATTENDING_PHYSICIAN_STATEMENT" => &[
            "Additional Medical Records",
            "Specialist Reports Referenced in APS",
            "Treatment Plan Documentation",
            "Follow-up Appointment Schedule",
        ],
        "LAB_REPORT" => &[
            "Previous Lab Results for Comparison",
            "Physician's Interpretation of Results",
            "Prescription Records Related to Conditions",
        ],
        _ => &[
            "Valid Government-Issued Identification Document",
            "Proof of Address (e.g., utility bill)",
        ],
    }
}

pub fn language_instruction(language: Language) -> String {
    format!("Respond in {}.", language.display_name())
}

fn bullet_list(items: &[&str]) -> String {
    items
        .iter()
        .map(|item| format!("\n  - {}", item))
        .collect()
}

pub fn classification_system(insurance_type: InsuranceType) -> String {
    format!(
        "You classify scanned insurance documents from their first page.\n\
         Allowed document types: {}.\n\
         Answer with a single JSON object: {{\"document_type\": \"<TYPE>\"}}. \
         Use OTHER when nothing fits. No text outside the JSON.",
        document_types(insurance_type).join(", ")
    )
}

pub fn extraction_system(insurance_type: InsuranceType, language: Language) -> String {
    let focus = match insurance_type {
        InsuranceType::Life => {
            "applicant identity, coverage requested, medical history, diagnoses, medications, lab values, lifestyle and financial details"
        }
        InsuranceType::PropertyCasualty => {
            "applicant and business details, locations, construction, occupancy, protection, loss history, coverage limits and financial details"
        }
    };
    format!(
        "You extract structured data from insurance document page images. Focus on {}.\n\
         Return one JSON object whose keys are document sub-types (for example \"Lab Report\") \
         and whose values are lists of page objects. Each page object has a \"page_number\" and \
         the fields found on that page. Keep values exactly as written on the page.\n\
         {} Field names stay in English.",
        focus,
        language_instruction(language)
    )
}

pub fn extraction_message(document_type: &str, pages: &[usize], previous: &str) -> String {
    let numbers: Vec<String> = pages.iter().map(usize::to_string).collect();
    format!(
        "Document type: {}\nAttached page(s): {}\n\
         Data extracted from earlier pages, for context only (do not repeat it):\n{}\n\n\
         Return the JSON object for the attached page(s).",
        document_type,
        numbers.join(", "),
        previous
    )
}

pub const ANALYSIS_SYSTEM: &str =
    "You are an expert insurance underwriter analyzing data extracted from an insurance document.";

pub fn analysis_message(chunk_json: &str, chunk_note: Option<String>, language: Language) -> String {
    format!(
        r#"<extracted_data>
{}
</extracted_data>{}

Produce a single JSON object with these keys:
- "overall_summary": what the document contains and its purpose.
- "identified_risks": list of {{"risk_description", "severity" (Low, Medium or High), "page_references" (list of strings, ["N/A"] when unknown)}}.
- "discrepancies": list of {{"discrepancy_description", "details", "page_references"}}.
- "medical_timeline": Markdown timeline for medical documents, else "N/A".
- "property_assessment": Markdown assessment for property documents, else "N/A".
- "final_recommendation": Markdown recommendation for the underwriter.
- "missing_information": list of {{"item_description", "notes"}}.
- "confidence_score": 0.0 to 1.0 reflecting data quality; omit if unsure.
Use [] for empty lists. {} All prose must be in that language. Return only the JSON object."#,
        chunk_json,
        chunk_note
            .map(|note| format!("\n\nNote: {}", note))
            .unwrap_or_default(),
        language_instruction(language)
    )
}

pub fn chunk_note(chunk_id: u64, total_chunks: u64) -> Option<String> {
    (total_chunks > 1).then(|| {
        format!(
            "This is chunk {} of {}. Analyze this subset of the document.",
            chunk_id + 1,
            total_chunks
        )
    })
}

pub fn detection_system(insurance_type: InsuranceType, language: Language) -> String {
    let tools = match insurance_type {
        InsuranceType::Life => {
            "For every impairment call kb_search with its canonical name and copy the returned \
             knowledgebase_location into the impairment. Use scratch_pad to track impairments \
             you have already found."
        }
        InsuranceType::PropertyCasualty => {
            "Use scratch_pad to track hazards you have already found."
        }
    };
    let subject = match insurance_type {
        InsuranceType::Life => "medical impairments (conditions, abnormal lab values, risky habits)",
        InsuranceType::PropertyCasualty => {
            "property and liability hazards (construction, occupancy, exposure, loss history)"
        }
    };
    format!(
        r#"You detect {} in extracted underwriting data.
{}
Answer with one JSON object:
{{"impairments": [{{"impairment_id": "<snake_case id>", "scoring_factors": {{...}}, "evidence": ["<quote>"], "knowledgebase_location": "<location or null>"}}], "narrative": "<short summary>"}}
Give each impairment once, with every scoring factor found. {} Keys and ids stay in English."#,
        subject,
        tools,
        language_instruction(language)
    )
}

pub fn detection_message(chunk_json: &str, chunk_note: Option<String>) -> String {
    match chunk_note {
        Some(note) => format!("{}\n\nExtracted data:\n{}", note, chunk_json),
        None => format!("Extracted data:\n{}", chunk_json),
    }
}

pub fn scoring_system(insurance_type: InsuranceType) -> String {
    let method = match insurance_type {
        InsuranceType::Life => {
            "Look up each impairment with kb_search and apply the manual's debits for its \
             scoring factors."
        }
        InsuranceType::PropertyCasualty => {
            "Assign each hazard debit points from 0 to 100 by severity and exposure."
        }
    };
    format!(
        r#"You score detected underwriting impairments. {}
Add the sub totals with the calculator tool; never add numbers yourself.
Answer with one JSON object:
{{"total_score": <number>, "impairment_scores": [{{"impairment_id": "<id>", "sub_total": <number>, "reason": "<why>"}}]}}"#,
        method
    )
}

pub const SCORING_MESSAGE_PREFIX: &str = "Here is the JSON payload of impairments to score:\n\n";

pub fn action_system(insurance_type: InsuranceType, language: Language) -> String {
    let (rules, mapped) = match insurance_type {
        InsuranceType::Life => (
            "- LIFE_INSURANCE_APPLICATION: ineligible when cancer was diagnosed within the last 3 years \
             ('recent cancer diagnosis'), the applicant is over 85 ('age exceeds maximum limit'), or a \
             heart attack or stroke occurred within the last 12 months ('recent cardiac/stroke event').",
            ["LIFE_INSURANCE_APPLICATION", "MEDICAL_REPORT"],
        ),
        InsuranceType::PropertyCasualty => (
            "- COMMERCIAL_PROPERTY_APPLICATION: ineligible when the business type is Nightclub or \
             Explosives Manufacturing (name the type), or construction is Wood Frame in a High or \
             Extreme wildfire zone (name the combination).\n\
             - Any type: ineligible when a crime report gives property crime grade F \
             ('Property Crime Grade is F').",
            ["COMMERCIAL_PROPERTY_APPLICATION", "GENERAL_LIABILITY_APP_V2"],
        ),
    };

    let mut documents = String::new();
    for app_type in mapped {
        documents.push_str(&format!(
            "\n- {}:{}",
            app_type,
            bullet_list(supporting_documents(app_type))
        ));
    }
    documents.push_str(&format!(
        "\n- Any other type:{}",
        bullet_list(supporting_documents("DEFAULT_APP_TYPE"))
    ));

    format!(
        r#"You are an underwriting assistant doing initial application triage. Choose exactly one tool.

Ineligibility rules, checked first:
{}
- Any type: ineligible when applicant_details.sanctioned_entity_status is Positive or MatchFound ('sanctioned entity match'), or a requested policy start date is in the past ('past policy start date').

If a rule matches, call send_ineligibility_notice with the document_identifier and the reason for that rule only.

Otherwise call request_supporting_documents with the documents for the application type:{}
Send it to applicant_details.email when present, else underwriting-dept@example.com. The email_body greets the applicant, cites the document_identifier, lists each document on its own "- " line and closes with "Sincerely, Underwriting Department".

Do not ask questions. {} All generated text must be in that language."#,
        rules,
        documents,
        language_instruction(language)
    )
}

pub fn action_message(document_identifier: &str, application_type: &str, data_json: &str) -> String {
    format!(
        "Triage the following insurance application.\nDocument Identifier: {}\nApplication Type: {}\nExtracted Data: {}",
        document_identifier, application_type, data_json
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supporting_documents_default() {
        assert_eq!(supporting_documents("UNKNOWN").len(), 2);
        assert_eq!(supporting_documents("LAB_REPORT").len(), 3);
    }

    #[test]
    fn test_chunk_note_only_for_multiple_chunks() {
        assert!(chunk_note(0, 1).is_none());
        assert_eq!(
            chunk_note(1, 3).as_deref(),
            Some("This is chunk 2 of 3. Analyze this subset of the document.")
        );
    }

    #[test]
    fn test_prompts_follow_language_and_line() {
        let life = action_system(InsuranceType::Life, Language::DeDe);
        assert!(life.contains("Respond in German (Deutsch)."));
        assert!(life.contains("Medical Records Release Form"));
        assert!(!life.contains("Nightclub"));

        let pc = classification_system(InsuranceType::PropertyCasualty);
        assert!(pc.contains("CRIME_REPORT"));
        assert!(!pc.contains("LAB_REPORT"));
    }

    #[test]
    fn test_analysis_message_embeds_data() {
        let message = analysis_message("{\"A\": []}", chunk_note(0, 2), Language::EnUs);
        assert!(message.starts_with("<extracted_data>\n{\"A\": []}\n</extracted_data>\n\nNote: This is chunk 1 of 2."));
        assert!(message.contains("Respond in English."));
    }
}
