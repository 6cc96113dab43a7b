pub mod academic_classes;
pub mod backup;
pub mod core;
pub mod courses;
pub mod dashboard;
pub mod departments;
pub mod enrollments;
pub mod grades;
pub mod lecturers;
pub mod major_courses;
pub mod majors;
pub mod sections;
pub mod settings;
pub mod students;
pub mod transcripts;
