// repeat-predictor schema - call analysis tables for Diesel ORM

diesel::table! {
    call_analysis (incident) {
        incident -> BigInt,
        attend_date_time -> Text,
        business_type -> Nullable<Text>,
        manufacturer -> Nullable<Text>,
        product_id -> Nullable<Text>,
        device_type -> Nullable<Text>,
        last_other_call_type -> Nullable<Text>,
        created_by -> Nullable<Text>,
        created_day -> Nullable<Text>,
        attend_day -> Nullable<Text>,
        post_code_area -> Nullable<Text>,
        first_engineer -> Nullable<Text>,
        symptom_code_id -> Nullable<Text>,
        device_age_days -> Nullable<Double>,
        days_since_install -> Nullable<Double>,
        days_since_last_break -> Nullable<Double>,
        days_since_last_other_call -> Nullable<Double>,
        meter_total -> Nullable<Double>,
        meter_since_last_call -> Nullable<Double>,
        repeated -> Nullable<Text>,        // 'YES' / 'NO', NULL while the repeat window is open
    }
}

diesel::table! {
    call_predictions (id) {
        id -> Integer,
        prediction_date -> Text,
        incident -> BigInt,
        threshold -> Double,
        predicted -> Bool,
        confidence -> Double,
        actual -> Nullable<Bool>,
        correct -> Nullable<Text>,         // 'CORRECT' / 'INCORRECT' / 'PENDING'
        created_at -> Text,
    }
}

diesel::table! {
    call_analysis_log (id) {
        id -> Integer,
        logged_at -> Text,
        description -> Text,
    }
}
